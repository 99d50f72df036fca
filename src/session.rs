use crate::connection::{ConnectionCore, ConnectionState};
use crate::error::Error;
use crate::frame::CloseCode;
use crate::message::Message;
use crate::split::WSWriter;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

/// 32 hex characters, unique within a service, stable for the session's
/// lifetime. Derived from a v8 UUID seeded by a CSPRNG, the same source
/// masking keys come from.
pub(crate) fn generate_session_id() -> String {
    let mut rng = StdRng::from_rng(&mut rand::rng());
    let buf = rng.random::<[u8; 16]>();

    Uuid::new_v8(buf).simple().to_string()
}

/// One server-side connection bound to a service: its id, the shared send
/// half and the connection core the manager reads state and idle time from.
#[derive(Clone)]
pub struct Session {
    id: String,
    writer: Arc<Mutex<WSWriter>>,
    core: Arc<ConnectionCore>,
}

impl Session {
    pub(crate) fn new(id: String, writer: Arc<Mutex<WSWriter>>, core: Arc<ConnectionCore>) -> Self {
        Self { id, writer, core }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.core.idle_for()
    }

    async fn send(&self, message: Message) -> Result<(), Error> {
        self.writer.lock().await.send_message(message).await
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), Error> {
        self.writer.lock().await.close(code, reason).await
    }

    /// Ping with the pong wait bounded by `wait_time` instead of the
    /// connection's own close timeout. The waiter is registered before the
    /// writer lock is taken so a fast pong can never be missed.
    async fn ping_with_wait(&self, payload: Option<Vec<u8>>, wait_time: Duration) -> bool {
        let pong = self.core.register_pong_waiter();
        if self
            .writer
            .lock()
            .await
            .send_ping(payload)
            .await
            .is_err()
        {
            return false;
        }
        matches!(timeout(wait_time, pong).await, Ok(Ok(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Ready = 0,
    Start = 1,
    ShuttingDown = 2,
    Stop = 3,
}

impl ManagerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ManagerState::Ready,
            1 => ManagerState::Start,
            2 => ManagerState::ShuttingDown,
            _ => ManagerState::Stop,
        }
    }
}

/// The per-service set of open sessions. Membership lives in a sharded map
/// so broadcasts and sweeps never hold one big lock; the manager state
/// gates admission during startup and drain.
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    state: AtomicU8,
    wait_time: Duration,
}

impl SessionManager {
    pub(crate) fn new(wait_time: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            state: AtomicU8::new(ManagerState::Ready as u8),
            wait_time,
        }
    }

    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn start(&self) {
        let _ = self.state.compare_exchange(
            ManagerState::Ready as u8,
            ManagerState::Start as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Whether new sessions would currently be admitted.
    pub fn accepting(&self) -> bool {
        matches!(self.state(), ManagerState::Ready | ManagerState::Start)
    }

    /// Registers a session. Rejected while draining or stopped, and on id
    /// collision, so a session id is never silently replaced.
    pub(crate) fn add(&self, session: Session) -> Result<(), Error> {
        if !self.accepting() {
            return Err(Error::ManagerNotAccepting);
        }
        match self.sessions.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::SessionAlreadyExists(session.id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(session);
                Ok(())
            }
        }
    }

    /// Detaches one session and closes its connection.
    pub async fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            if session.state() != ConnectionState::Closed {
                if let Err(error) = session.close(CloseCode::AWAY, "").await {
                    debug!("closing removed session {} failed: {}", id, error);
                }
            }
        }
    }

    /// Drops a finished session without touching the connection. Used once
    /// a session's driver loop has already observed the close.
    pub(crate) fn detach(&self, id: &str) {
        self.sessions.remove(id);
    }

    fn open_sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Open)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sends one message to every session currently Open. Returns once all
    /// sends have been issued; per-session failures are logged, not
    /// propagated, so one dead peer can't veto the rest.
    pub async fn broadcast(&self, message: Message) {
        let sessions = self.open_sessions();
        let sends = sessions.iter().map(|session| {
            let message = message.clone();
            async move {
                if let Err(error) = session.send(message).await {
                    warn!("broadcast to session {} failed: {}", session.id(), error);
                }
            }
        });
        join_all(sends).await;
    }

    pub async fn broadcast_text(&self, text: impl Into<String>) {
        self.broadcast(Message::Text(text.into())).await;
    }

    pub async fn broadcast_binary(&self, data: Vec<u8>) {
        self.broadcast(Message::Binary(data)).await;
    }

    /// Buffers a byte source once and broadcasts it as a single binary
    /// message, so N sessions don't read the source N times.
    pub async fn broadcast_stream<R: AsyncRead + Unpin>(&self, mut source: R) -> Result<(), Error> {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.broadcast(Message::Binary(data)).await;
        Ok(())
    }

    /// Pings every open session and reports, per session id, whether a
    /// Pong came back within the service's wait time.
    pub async fn broadping(&self, payload: Option<Vec<u8>>) -> HashMap<String, bool> {
        let sessions = self.open_sessions();
        let pings = sessions.iter().map(|session| {
            let payload = payload.clone();
            async move { (session.id().to_string(), session.ping_with_wait(payload, self.wait_time).await) }
        });
        join_all(pings).await.into_iter().collect()
    }

    /// Closes sessions that have been quiet past `threshold` and prunes
    /// entries whose connections already died.
    pub(crate) async fn sweep(&self, threshold: Duration) {
        let mut stale = Vec::new();
        let mut dead = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            match session.state() {
                ConnectionState::Closed => dead.push(session.clone()),
                _ if session.idle_for() > threshold => stale.push(session.clone()),
                _ => {}
            }
        }

        for session in dead {
            self.sessions.remove(session.id());
        }
        for session in stale {
            info!("sweeping inactive session {}", session.id());
            if let Err(error) = session.close(CloseCode::AWAY, "session timed out").await {
                debug!("sweep close for {} failed: {}", session.id(), error);
            }
            self.sessions.remove(session.id());
        }
    }

    /// Drains the service: sends Close to every session with the given
    /// status, waits out the close handshakes, then refuses all further
    /// admissions.
    pub async fn stop(&self, code: u16, reason: &str) {
        let was_running = self
            .state
            .compare_exchange(
                ManagerState::Start as u8,
                ManagerState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
            || self
                .state
                .compare_exchange(
                    ManagerState::Ready as u8,
                    ManagerState::ShuttingDown as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        if !was_running {
            return;
        }

        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let closes = sessions.iter().map(|session| async move {
            if let Err(error) = session.close(code, reason).await {
                debug!("stop close for {} failed: {}", session.id(), error);
            }
        });
        join_all(closes).await;

        self.sessions.clear();
        self.state.store(ManagerState::Stop as u8, Ordering::Release);
    }
}
