use crate::compression::Encoder;
use crate::config::WebSocketConfig;
use crate::connection::{ConnectionCore, ConnectionState};
use crate::error::Error;
use crate::frame::{CloseCode, Frame, OpCode};
use crate::message::Message;
use crate::write::Writer;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

/// The receiving half handed to the end-user: a plain `Stream` of inbound
/// messages, so the mpsc channel fed by the receive driver stays hidden.
pub struct WSReader {
    read_rx: ReceiverStream<Result<Message, Error>>,
}

impl WSReader {
    pub(crate) fn new(read_rx: Receiver<Result<Message, Error>>) -> Self {
        Self {
            read_rx: ReceiverStream::new(read_rx),
        }
    }
}

impl Stream for WSReader {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.read_rx).poll_next(cx)
    }
}

/// The sending half. All application traffic funnels through here; frames
/// of one message are emitted back-to-back through the shared writer lock,
/// so locally-originated frames never interleave mid-message.
pub struct WSWriter {
    writer: Arc<Mutex<Writer>>,
    config: WebSocketConfig,
    encoder: Option<Encoder>,
    core: Arc<ConnectionCore>,
}

impl WSWriter {
    pub(crate) fn new(
        writer: Arc<Mutex<Writer>>,
        config: WebSocketConfig,
        encoder: Option<Encoder>,
        core: Arc<ConnectionCore>,
    ) -> Self {
        Self {
            writer,
            config,
            encoder,
            core,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub(crate) fn core(&self) -> Arc<ConnectionCore> {
        Arc::clone(&self.core)
    }

    // Application sends are only legal while the connection is Open; a
    // close in flight fails them with ConnectionClosing, a finished close
    // with ConnectionClosed
    fn ensure_open(&self) -> Result<(), Error> {
        match self.core.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Connecting | ConnectionState::Closing => Err(Error::ConnectionClosing),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
        }
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.write_message(message).await
    }

    // This function will be used to send general data as a Vector of bytes,
    // and by default will be sent as a text opcode
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Text(String::from_utf8(data)?))
            .await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.write_message(Message::Binary(data)).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.write_message(Message::Text(data)).await
    }

    /// Streams a byte source of known or unknown length as one fragmented
    /// binary message, one frame per `fragment_size` chunk. The final frame
    /// is marked when the source reports end of stream.
    pub async fn send_stream<R: AsyncRead + Unpin>(&mut self, mut source: R) -> Result<(), Error> {
        self.ensure_open()?;
        let fragment_size = self.config.fragment_size();

        let mut current = read_chunk(&mut source, fragment_size).await?;
        let mut first = true;
        loop {
            // One chunk of lookahead decides whether the frame in hand is
            // the final fragment.
            let next = read_chunk(&mut source, fragment_size).await?;
            let is_final = next.is_empty();
            let opcode = if first { OpCode::Binary } else { OpCode::Continue };
            self.write_frames(vec![Frame::new(is_final, opcode, current, false)])
                .await?;
            if is_final {
                return Ok(());
            }
            current = next;
            first = false;
        }
    }

    /// Sends a Ping and waits for the matching Pong. Returns whether the
    /// peer answered within the close timeout; at most one ping can be
    /// outstanding per connection.
    pub async fn ping(&mut self, payload: Option<Vec<u8>>) -> Result<bool, Error> {
        self.ensure_open()?;
        let pong = self.core.register_pong_waiter();
        let frame = Frame::ping(payload.unwrap_or_default())?;
        self.writer.lock().await.write_frame(frame, false).await?;

        match timeout(self.config.close_timeout(), pong).await {
            Ok(Ok(_)) => Ok(true),
            _ => Ok(false),
        }
    }

    /// Fire-and-forget Ping, for callers that track the Pong themselves.
    pub async fn send_ping(&mut self, payload: Option<Vec<u8>>) -> Result<(), Error> {
        self.ensure_open()?;
        let frame = Frame::ping(payload.unwrap_or_default())?;
        self.writer.lock().await.write_frame(frame, false).await
    }

    /// Starts the close handshake: sends a Close frame with `code` and
    /// `reason` and waits for the peer's echo, bounded by the close
    /// timeout. Idempotent; only the caller that wins the Open -> Closing
    /// transition sends the frame, later calls return immediately.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        let frame = Frame::close(code, reason)?;
        if !self
            .core
            .transition(ConnectionState::Open, ConnectionState::Closing)
        {
            return Ok(());
        }

        let peer_close = self.core.register_close_waiter();
        if let Err(error) = self.writer.lock().await.write_frame(frame, false).await {
            self.core.set_state(ConnectionState::Closed);
            let _ = self.writer.lock().await.shutdown().await;
            return Err(error);
        }

        // Either the receive driver completes the waiter with the peer's
        // echo, or the timeout forces the local side to Closed anyway.
        let _ = timeout(self.config.close_timeout(), peer_close).await;

        self.core.set_state(ConnectionState::Closed);
        let _ = self.writer.lock().await.shutdown().await;
        Ok(())
    }

    /// Normal closure, status 1000.
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.close(CloseCode::NORMAL, "").await
    }

    fn check_compression(&mut self, data: &mut Vec<u8>) -> Result<bool, Error> {
        // Empty payloads aren't worth a compressed block
        if data.is_empty() {
            return Ok(false);
        }
        match self.encoder.as_mut() {
            Some(encoder) => {
                *data = encoder.compress(data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn convert_to_frames(&mut self, message: Message) -> Result<Vec<Frame>, Error> {
        let (opcode, mut payload) = match message {
            Message::Text(text) => (OpCode::Text, text.into_bytes()),
            Message::Binary(data) => (OpCode::Binary, data),
            Message::Close(_) => return Err(Error::InvalidOpcode),
        };

        if payload.is_empty() {
            return Ok(vec![Frame::new(true, opcode, payload, false)]);
        }

        let fragment_size = self.config.fragment_size();
        if fragment_size > self.config.max_frame_size() {
            return Err(Error::CustomFragmentSizeExceeded(
                fragment_size,
                self.config.max_frame_size(),
            ));
        }

        // The whole message is compressed once, then the compressed bytes
        // are fragmented; only the first frame of the sequence carries the
        // compressed flag
        let compressed = self.check_compression(&mut payload)?;

        let mut frames = Vec::new();
        for chunk in payload.chunks(fragment_size) {
            frames.push(Frame {
                final_fragment: false,
                opcode: if frames.is_empty() {
                    opcode.clone()
                } else {
                    OpCode::Continue
                },
                payload: chunk.to_vec(),
                compressed,
            });
        }

        if let Some(last_frame) = frames.last_mut() {
            last_frame.final_fragment = true;
        }

        Ok(frames)
    }

    pub(crate) async fn write_message(&mut self, message: Message) -> Result<(), Error> {
        self.ensure_open()?;

        if message.as_binary().len() > self.config.max_message_size() {
            return Err(Error::MaxMessageSize);
        }

        let frames = self.convert_to_frames(message)?;
        self.write_frames(frames).await
    }

    async fn write_frames(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        // For compressed messages, fragmented or not, the RSV1 bit is set
        // on the first frame of the sequence only
        let mut set_rsv1 = frames.first().map(|frame| frame.compressed).unwrap_or(false);

        for frame in frames {
            self.writer.lock().await.write_frame(frame, set_rsv1).await?;
            set_rsv1 = false;
        }
        Ok(())
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, size: usize) -> Result<Vec<u8>, Error> {
    let mut chunk = vec![0u8; size];
    let mut filled = 0;
    // A short read doesn't mean end of stream; keep filling until the
    // chunk is full or the source is exhausted.
    while filled < size {
        let n = source.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(chunk)
}
