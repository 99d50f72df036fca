use crate::error::Error;
use crate::frame::ClosePayload;
use crate::message::Message;
use crate::split::{WSReader, WSWriter};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

/// Lifecycle of one connection. Both roles share the same machine:
/// Connecting until the handshake completes, Open for traffic, Closing
/// while the close handshake is in flight, Closed once the stream is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// State shared between the receive driver and every writer handle: the
/// atomic lifecycle state, the single outstanding ping waiter, the close
/// handshake waiter, and the last-activity timestamp the sweeper reads.
pub(crate) struct ConnectionCore {
    state: AtomicU8,
    pong_waiter: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    close_waiter: Mutex<Option<oneshot::Sender<Option<ClosePayload>>>>,
    last_activity: Mutex<Instant>,
}

impl ConnectionCore {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            pong_waiter: Mutex::new(None),
            close_waiter: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Compare-and-swap transition; returns whether this caller won it.
    /// Close requests race between the two sides and only one may act.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// At most one ping may be outstanding; a new one replaces (and thereby
    /// fails) a waiter that never got its pong.
    pub fn register_pong_waiter(&self) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        *self.pong_waiter.lock().unwrap() = Some(tx);
        rx
    }

    pub fn complete_pong(&self, payload: Vec<u8>) {
        if let Some(waiter) = self.pong_waiter.lock().unwrap().take() {
            let _ = waiter.send(payload);
        }
    }

    pub fn register_close_waiter(&self) -> oneshot::Receiver<Option<ClosePayload>> {
        let (tx, rx) = oneshot::channel();
        *self.close_waiter.lock().unwrap() = Some(tx);
        rx
    }

    pub fn complete_close(&self, payload: Option<ClosePayload>) {
        if let Some(waiter) = self.close_waiter.lock().unwrap().take() {
            let _ = waiter.send(payload);
        }
    }

    /// Drops both waiter slots so anything awaiting them resolves now
    /// instead of running out its timeout. Used when the transport dies.
    pub fn abandon_waiters(&self) {
        self.pong_waiter.lock().unwrap().take();
        self.close_waiter.lock().unwrap().take();
    }
}

/// A live WebSocket connection: a stream of inbound messages plus the send
/// half. Splitting hands the two halves to separate tasks.
pub struct WSConnection {
    reader: WSReader,
    writer: WSWriter,
    subprotocol: Option<String>,
}

impl WSConnection {
    pub(crate) fn new(reader: WSReader, writer: WSWriter, subprotocol: Option<String>) -> Self {
        Self {
            reader,
            writer,
            subprotocol,
        }
    }

    /// Splits the connection, so incoming messages can be monitored in a
    /// separate task while the writer is handed to the end-user.
    pub fn split(self) -> (WSReader, WSWriter) {
        (self.reader, self.writer)
    }

    pub fn state(&self) -> ConnectionState {
        self.writer.state()
    }

    /// The subprotocol the handshake settled on, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub async fn send_message(&mut self, message: Message) -> Result<(), Error> {
        self.writer.send_message(message).await
    }

    // This function will be used to send general data as a Vector of bytes,
    // and by default will be sent as a text opcode
    pub async fn send(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send(data).await
    }

    pub async fn send_as_binary(&mut self, data: Vec<u8>) -> Result<(), Error> {
        self.writer.send_as_binary(data).await
    }

    pub async fn send_as_text(&mut self, data: String) -> Result<(), Error> {
        self.writer.send_as_text(data).await
    }

    /// Streams a byte source out as one fragmented binary message.
    pub async fn send_stream<R: AsyncRead + Unpin>(&mut self, source: R) -> Result<(), Error> {
        self.writer.send_stream(source).await
    }

    /// Sends a Ping and reports whether the peer answered with a Pong
    /// within the configured close timeout.
    pub async fn ping(&mut self, payload: Option<Vec<u8>>) -> Result<bool, Error> {
        self.writer.ping(payload).await
    }

    /// Starts the close handshake with the given status code and reason and
    /// waits for the peer's echo, bounded by the close timeout.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        self.writer.close(code, reason).await
    }

    /// Normal closure, status 1000.
    pub async fn close_connection(&mut self) -> Result<(), Error> {
        self.writer.close_connection().await
    }
}

impl Stream for WSConnection {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.reader).poll_next(cx)
    }
}
