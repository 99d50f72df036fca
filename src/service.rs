use crate::config::DEFAULT_CLOSE_TIMEOUT;
use crate::connection::{ConnectionCore, ConnectionState};
use crate::error::Error;
use crate::frame::{CloseCode, ClosePayload};
use crate::message::Message;
use crate::session::{Session, SessionManager};
use crate::split::{WSReader, WSWriter};
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(300);

/// Per-service tuning, set when the service is registered.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Whether a background task periodically closes inactive sessions.
    pub keep_clean: bool,
    /// Overrides the close/pong wait for this service's sessions.
    pub wait_time: Option<Duration>,
    /// How long a session may stay quiet before the sweeper closes it.
    pub inactivity_threshold: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            keep_clean: true,
            wait_time: None,
            inactivity_threshold: None,
        }
    }
}

impl ServiceOptions {
    pub(crate) fn wait_time(&self) -> Duration {
        self.wait_time.unwrap_or(DEFAULT_CLOSE_TIMEOUT)
    }

    fn inactivity_threshold(&self) -> Duration {
        self.inactivity_threshold
            .unwrap_or(DEFAULT_INACTIVITY_THRESHOLD)
    }
}

/// What a service implements: lifecycle hooks with no-op defaults plus the
/// handshake validators. One behavior instance is created per session, so
/// implementations may keep per-session state in plain fields.
#[async_trait]
pub trait WebSocketBehavior: Send {
    async fn on_open(&mut self, session: &SessionHandle) {
        let _ = session;
    }

    async fn on_message(&mut self, session: &SessionHandle, message: Message) {
        let _ = (session, message);
    }

    async fn on_error(&mut self, session: &SessionHandle, error: &Error) {
        let _ = (session, error);
    }

    async fn on_close(&mut self, session: &SessionHandle, close: Option<&ClosePayload>) {
        let _ = (session, close);
    }

    /// Called with the Origin header before the handshake is answered;
    /// returning false rejects the request with 403.
    fn validate_origin(&self, origin: Option<&str>) -> bool {
        let _ = origin;
        true
    }

    /// Called with the Cookie header before the handshake is answered;
    /// returning false rejects the request with 403.
    fn validate_cookies(&self, cookies: Option<&str>) -> bool {
        let _ = cookies;
        true
    }

    /// Called with the Authorization header before the handshake is
    /// answered. The resolver owns the Basic/Digest verification; returning
    /// false rejects the request with 401.
    fn validate_credentials(&self, authorization: Option<&str>) -> bool {
        let _ = authorization;
        true
    }

    /// Picks one of the subprotocols the client offered. `None` answers
    /// the handshake without a Sec-WebSocket-Protocol header.
    fn select_subprotocol(&self, offered: &[&str]) -> Option<String> {
        let _ = offered;
        None
    }
}

pub(crate) type BehaviorFactory = Arc<dyn Fn() -> Box<dyn WebSocketBehavior> + Send + Sync>;

/// The capability record a behavior acts through: this session's id and
/// send half, plus the service's session manager for broadcast and
/// broadping. Holds no ownership of the session itself.
pub struct SessionHandle {
    id: String,
    writer: Arc<Mutex<WSWriter>>,
    core: Arc<ConnectionCore>,
    sessions: Arc<SessionManager>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: String,
        writer: Arc<Mutex<WSWriter>>,
        core: Arc<ConnectionCore>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            id,
            writer,
            core,
            sessions,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// The service-wide session manager, for broadcast and broadping.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn send_message(&self, message: Message) -> Result<(), Error> {
        self.writer.lock().await.send_message(message).await
    }

    pub async fn send_text(&self, text: impl Into<String> + Send) -> Result<(), Error> {
        self.send_message(Message::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.send_message(Message::Binary(data)).await
    }

    /// Streams a byte source to this session as one fragmented message.
    pub async fn send_stream<R: AsyncRead + Unpin + Send>(&self, source: R) -> Result<(), Error> {
        self.writer.lock().await.send_stream(source).await
    }

    pub async fn ping(&self, payload: Option<Vec<u8>>) -> Result<bool, Error> {
        self.writer.lock().await.ping(payload).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        self.writer.lock().await.close(code, reason).await
    }
}

/// One registered service: the behavior factory, its session manager and
/// the sweeper task when the service keeps itself clean.
pub(crate) struct ServiceHost {
    path: String,
    factory: BehaviorFactory,
    sessions: Arc<SessionManager>,
    options: ServiceOptions,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
}

impl ServiceHost {
    pub fn new(path: String, factory: BehaviorFactory, options: ServiceOptions) -> Self {
        let sessions = Arc::new(SessionManager::new(options.wait_time()));
        Self {
            path,
            factory,
            sessions,
            options,
            sweeper: StdMutex::new(None),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn new_behavior(&self) -> Box<dyn WebSocketBehavior> {
        (self.factory)()
    }

    /// Marks the manager started and, for keep-clean services, spawns the
    /// periodic sweep of inactive sessions.
    pub fn start(&self) {
        self.sessions.start();

        if self.options.keep_clean {
            let sessions = Arc::clone(&self.sessions);
            let threshold = self.options.inactivity_threshold();
            let handle = tokio::spawn(async move {
                let mut ticker = interval(SWEEP_INTERVAL);
                // The first tick fires immediately; skip it so a freshly
                // started service isn't swept before anyone connects.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    sessions.sweep(threshold).await;
                }
            });
            *self.sweeper.lock().unwrap() = Some(handle);
        }
    }

    /// Stops the sweeper and drains every session with the given status.
    pub async fn stop(&self, code: u16, reason: &str) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.sessions.stop(code, reason).await;
    }

    /// Owns one session from open to close: registers it, runs the
    /// behavior hooks off the message stream, and detaches it at the end.
    /// The dispatcher hands the connection off here and never touches
    /// frames again.
    pub async fn run_session(
        &self,
        mut behavior: Box<dyn WebSocketBehavior>,
        session: Session,
        handle: SessionHandle,
        mut reader: WSReader,
    ) -> Result<(), Error> {
        // OnOpen runs before the session becomes visible to broadcasts
        // from its peers.
        behavior.on_open(&handle).await;
        if let Err(error) = self.sessions.add(session) {
            // The manager started draining between the handshake and here.
            let _ = handle.close(CloseCode::AWAY, "service unavailable").await;
            return Err(error);
        }

        let mut close_seen = false;
        while let Some(result) = reader.next().await {
            match result {
                Ok(Message::Close(payload)) => {
                    behavior.on_close(&handle, payload.as_ref()).await;
                    close_seen = true;
                    break;
                }
                Ok(message) => behavior.on_message(&handle, message).await,
                Err(error) => {
                    debug!(
                        "session {} on service {} errored: {}",
                        handle.id(),
                        self.path,
                        error
                    );
                    behavior.on_error(&handle, &error).await;
                }
            }
        }

        // Transport failures never produce a Close message; the hook still
        // fires so behaviors see exactly one close per session.
        if !close_seen {
            behavior.on_close(&handle, None).await;
        }

        self.sessions.detach(handle.id());
        Ok(())
    }
}
