use crate::compression::Decoder;
use crate::config::WebSocketConfig;
use crate::connection::{ConnectionCore, ConnectionState};
use crate::error::Error;
use crate::frame::{apply_mask, CloseCode, ClosePayload, Frame, OpCode, MAX_CONTROL_PAYLOAD};
use crate::message::Message;
use crate::stream::MeshStream;
use crate::utf8::Utf8Validator;
use crate::write::{Writer, WriterKind};
use log::debug;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufReader, ReadHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

// Frame payloads are consumed in small slices so a malicious length field
// never turns into one giant read.
const READ_CHUNK_SIZE: usize = 1024;
// Timeout for each payload chunk, to drop connections that pass the
// handshake and then stall mid-frame to hold the socket hostage.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The message currently being reassembled from fragments. Text messages
/// carry a streaming UTF-8 validator so malformed text fails at the
/// offending fragment instead of at the end.
struct FragmentedMessage {
    fragments: Vec<u8>,
    op_code: OpCode,
    compressed: bool,
    validator: Utf8Validator,
}

/// The receive driver. Exactly one of these exists per connection and it
/// exclusively owns the read half; everything it needs to say back (pong
/// echoes, close echoes) goes through the shared writer lock.
pub struct ReadStream {
    buf_reader: BufReader<ReadHalf<MeshStream>>,
    fragmented_message: Option<FragmentedMessage>,
    read_tx: Sender<Result<Message, Error>>,
    writer: Arc<Mutex<Writer>>,
    config: WebSocketConfig,
    decoder: Option<Decoder>,
    core: Arc<ConnectionCore>,
    kind: WriterKind,
}

impl ReadStream {
    pub(crate) fn new(
        buf_reader: BufReader<ReadHalf<MeshStream>>,
        read_tx: Sender<Result<Message, Error>>,
        writer: Arc<Mutex<Writer>>,
        config: WebSocketConfig,
        decoder: Option<Decoder>,
        core: Arc<ConnectionCore>,
        kind: WriterKind,
    ) -> Self {
        Self {
            buf_reader,
            fragmented_message: None,
            read_tx,
            writer,
            config,
            decoder,
            core,
            kind,
        }
    }

    /// Drives the connection until it closes: reads frames, reassembles
    /// messages, answers control frames inline and runs the close
    /// handshake. Any protocol violation is mapped to its close code,
    /// reported to the peer, and surfaced through the message channel.
    pub async fn poll_messages(&mut self) {
        loop {
            match self.read_frame().await {
                Ok(frame) => match self.process_frame(frame).await {
                    Ok(false) => {}
                    Ok(true) => break,
                    Err(error) => {
                        self.fail_connection(error).await;
                        break;
                    }
                },
                Err(error) => {
                    self.fail_connection(error).await;
                    break;
                }
            }
        }
    }

    /// One step of the inbound pipeline. Returns `Ok(true)` once the close
    /// handshake has finished and the driver should stop.
    async fn process_frame(&mut self, frame: Frame) -> Result<bool, Error> {
        self.core.touch();

        // Once a close is in flight, inbound data frames are discarded
        // wholesale, including continuations of a sequence whose first
        // frame was already dropped; Close/Ping/Pong are still handled.
        if !frame.opcode.is_control()
            && matches!(
                self.core.state(),
                ConnectionState::Closing | ConnectionState::Closed
            )
        {
            self.fragmented_message = None;
            return Ok(false);
        }

        match frame.opcode {
            // A fragmented message starts with a Text or Binary frame whose
            // FIN bit is clear; the data opcode and the compressed flag of
            // that first frame apply to the whole message
            OpCode::Text | OpCode::Binary if !frame.final_fragment => {
                if self.fragmented_message.is_some() {
                    return Err(Error::FragmentedInProgress);
                }
                let mut validator = Utf8Validator::new();
                if frame.opcode == OpCode::Text && !frame.compressed {
                    validator.push(&frame.payload)?;
                }
                if frame.payload.len() > self.config.max_message_size() {
                    return Err(Error::MaxMessageSize);
                }
                self.fragmented_message = Some(FragmentedMessage {
                    op_code: frame.opcode,
                    fragments: frame.payload,
                    compressed: frame.compressed,
                    validator,
                });
            }
            // From the second frame to the last, the opcode is Continue;
            // the final frame carries FIN set
            OpCode::Continue => {
                let fragmented_message = self
                    .fragmented_message
                    .as_mut()
                    .ok_or(Error::InvalidContinuationFrame)?;

                if fragmented_message.op_code == OpCode::Text && !fragmented_message.compressed {
                    fragmented_message.validator.push(&frame.payload)?;
                }
                fragmented_message
                    .fragments
                    .extend_from_slice(&frame.payload);

                if fragmented_message.fragments.len() > self.config.max_message_size() {
                    return Err(Error::MaxMessageSize);
                }

                if frame.final_fragment {
                    let mut assembled = self.fragmented_message.take().unwrap();
                    if assembled.op_code == OpCode::Text && !assembled.compressed {
                        assembled.validator.finish()?;
                    }
                    let payload = self.decompress_if_needed(assembled.compressed, assembled.fragments)?;
                    self.transmit_data(assembled.op_code, payload).await?;
                }
            }
            // A whole message in a single frame. Receiving one while a
            // fragmented message is still being assembled fails the
            // connection
            OpCode::Text | OpCode::Binary => {
                if self.fragmented_message.is_some() {
                    return Err(Error::InvalidFrameFragmentation);
                }
                if frame.payload.len() > self.config.max_message_size() {
                    return Err(Error::MaxMessageSize);
                }
                let payload = self.decompress_if_needed(frame.compressed, frame.payload)?;
                self.transmit_data(frame.opcode, payload).await?;
            }
            OpCode::Close => {
                self.handle_close(frame.payload).await?;
                return Ok(true);
            }
            // Ping answers don't wait for the current assembly to finish;
            // the assembly buffer is left untouched
            OpCode::Ping => {
                self.send_pong_frame(frame.payload).await?;
            }
            OpCode::Pong => {
                self.core.complete_pong(frame.payload);
            }
        }

        Ok(false)
    }

    fn decompress_if_needed(&mut self, compressed: bool, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
        if !compressed {
            return Ok(payload);
        }
        match self.decoder.as_mut() {
            Some(decoder) => decoder.decompress(&payload),
            // read_frame already rejects rsv1 without a negotiated extension
            None => Err(Error::RSVNotZero),
        }
    }

    async fn transmit_data(&mut self, op_code: OpCode, payload: Vec<u8>) -> Result<(), Error> {
        let message = match op_code {
            // The Text opcode MUST carry UTF-8; for compressed messages this
            // is the first point the plain bytes exist to be checked
            OpCode::Text => Message::Text(String::from_utf8(payload)?),
            _ => Message::Binary(payload),
        };
        self.read_tx
            .send(Ok(message))
            .await
            .map_err(|_| Error::CommunicationError)
    }

    /// Runs the receiving side of the close handshake. Whoever moved the
    /// state to Closing first initiated; the other side echoes.
    async fn handle_close(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let close = ClosePayload::parse(&payload)?;
        if let Some(close) = &close {
            if CloseCode::is_reserved(close.code) {
                return Err(Error::InvalidCloseCode(close.code));
            }
        }

        if self.core.transition(ConnectionState::Closing, ConnectionState::Closed) {
            // The peer echoed a close we initiated; wake the local closer.
            self.core.complete_close(close.clone());
        } else {
            // Peer-initiated close: echo the status code back, then drop
            // the transport.
            self.core.set_state(ConnectionState::Closing);
            let echo = match &close {
                Some(close) => Frame::close(close.code, "")?,
                None => Frame::close_empty(),
            };
            let mut writer = self.writer.lock().await;
            if let Err(error) = writer.write_frame(echo, false).await {
                debug!("failed to echo close frame: {}", error);
            }
            let _ = writer.shutdown().await;
            self.core.set_state(ConnectionState::Closed);
        }

        self.core.abandon_waiters();
        let _ = self.read_tx.send(Ok(Message::Close(close))).await;
        Ok(())
    }

    /// Maps a failure to its close code, reports it to the peer when the
    /// code is allowed on the wire, tears the connection down and surfaces
    /// the error through the message channel.
    async fn fail_connection(&mut self, error: Error) {
        let code = error.close_code();
        debug!("failing connection with status {}: {}", code, error);

        let state = self.core.state();
        if !CloseCode::is_reserved(code)
            && matches!(state, ConnectionState::Open | ConnectionState::Closing)
        {
            if let Ok(frame) = Frame::close(code, "") {
                let _ = self.writer.lock().await.write_frame(frame, false).await;
            }
        }

        self.core.set_state(ConnectionState::Closed);
        self.core.abandon_waiters();
        let _ = self.writer.lock().await.shutdown().await;
        let _ = self.read_tx.send(Err(error)).await;
    }

    async fn send_pong_frame(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        if self.core.state() == ConnectionState::Closed {
            return Ok(());
        }
        let pong_frame = Frame::pong(payload)?;
        self.writer.lock().await.write_frame(pong_frame, false).await
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame, Error> {
        let mut header = [0u8; 2];

        self.buf_reader.read_exact(&mut header).await?;

        // The first bit in the first byte tells us whether the current
        // frame is the final fragment of a message; the last 4 bits are the
        // opcode
        let final_fragment = (header[0] & 0b10000000) != 0;
        let opcode = OpCode::from(header[0] & 0b00001111)?;

        // RSV flags are only meaningful under a negotiated extension: RSV1
        // marks permessage-deflate on data frames, everything else must be
        // zero or the connection fails immediately
        let rsv1 = (header[0] & 0b01000000) != 0;
        let rsv2 = (header[0] & 0b00100000) != 0;
        let rsv3 = (header[0] & 0b00010000) != 0;

        if rsv2 || rsv3 {
            return Err(Error::RSVNotZero);
        }
        if rsv1 && (self.decoder.is_none() || !opcode.is_data()) {
            return Err(Error::RSVNotZero);
        }

        // Control opcodes (ping, pong, close) can't be fragmented
        if !final_fragment && opcode.is_control() {
            return Err(Error::ControlFramesFragmented);
        }

        // The first bit of the second byte is the mask flag, the remaining
        // 7 bits are the payload length or an extended-length marker
        let masked = (header[1] & 0b10000000) != 0;
        let mut length = (header[1] & 0b01111111) as usize;

        // Frames from client to server are always masked, frames from
        // server to client never are
        match self.kind {
            WriterKind::Server if !masked => return Err(Error::InvalidMaskBit),
            WriterKind::Client if masked => return Err(Error::InvalidMaskBit),
            _ => {}
        }

        // Control frames are only allowed a payload up to and including 125
        // octets, which also rules out the extended-length markers
        if length > MAX_CONTROL_PAYLOAD && opcode.is_control() {
            return Err(Error::ControlFramePayloadSize);
        }

        if length == 126 {
            let mut be_bytes = [0u8; 2];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            length = u16::from_be_bytes(be_bytes) as usize;
        } else if length == 127 {
            let mut be_bytes = [0u8; 8];
            self.buf_reader.read_exact(&mut be_bytes).await?;
            // The most significant bit of a 64-bit length must be zero
            if be_bytes[0] & 0b10000000 != 0 {
                return Err(Error::InvalidPayloadLength);
            }
            length = u64::from_be_bytes(be_bytes) as usize;
        }

        if length > self.config.max_frame_size() {
            return Err(Error::MaxFrameSize);
        }

        let mask = if masked {
            let mut mask = [0u8; 4];
            self.buf_reader.read_exact(&mut mask).await?;
            Some(mask)
        } else {
            None
        };

        let mut payload = Vec::with_capacity(length.min(64 * 1024));
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut remaining = length;
        while remaining > 0 {
            let wanted = remaining.min(READ_CHUNK_SIZE);
            timeout(READ_TIMEOUT, self.buf_reader.read_exact(&mut chunk[..wanted])).await??;
            payload.extend_from_slice(&chunk[..wanted]);
            remaining -= wanted;
        }

        // The client masks with a 4-byte key sent inside the frame; the
        // same XOR recovers the original payload
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Frame {
            final_fragment,
            opcode,
            payload,
            compressed: rsv1,
        })
    }
}
