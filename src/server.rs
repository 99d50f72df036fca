use crate::config::ServerConfig;
use crate::error::Error;
use crate::handshake::{
    build_accept_response, establish, http_error_response, negotiate_extensions,
    validate_upgrade_request,
};
use crate::request::HttpRequest;
use crate::service::{ServiceHost, ServiceOptions, SessionHandle, WebSocketBehavior};
use crate::session::{generate_session_id, Session};
use crate::stream::MeshStream;
use crate::utils::generate_websocket_accept_value;
use crate::write::WriterKind;
use dashmap::DashMap;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{split, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsStream};

/// A multi-service WebSocket server. Services are registered under URL
/// paths; the accept loop reads each socket's HTTP request, intercepts
/// WebSocket upgrades, and hands matching connections to the service's
/// host. Registration is allowed both before `start` and while running.
pub struct WebSocketServer {
    services: Arc<DashMap<String, Arc<ServiceHost>>>,
    config: ServerConfig,
    running: Arc<AtomicBool>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
}

impl WebSocketServer {
    pub fn new(config: Option<ServerConfig>) -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            config: config.unwrap_or_default(),
            running: Arc::new(AtomicBool::new(false)),
            accept_task: StdMutex::new(None),
        }
    }

    /// Registers a behavior factory under an absolute URL path. Each new
    /// session gets a fresh behavior from the factory.
    pub fn add_service<F>(&self, path: &str, factory: F)
    where
        F: Fn() -> Box<dyn WebSocketBehavior> + Send + Sync + 'static,
    {
        self.add_service_with_options(path, factory, ServiceOptions::default())
    }

    pub fn add_service_with_options<F>(&self, path: &str, factory: F, options: ServiceOptions)
    where
        F: Fn() -> Box<dyn WebSocketBehavior> + Send + Sync + 'static,
    {
        let path = normalize_path(path);
        let host = Arc::new(ServiceHost::new(path.clone(), Arc::new(factory), options));
        // Services added while the server runs go live immediately.
        if self.running.load(Ordering::Acquire) {
            host.start();
        }
        self.services.insert(path, host);
    }

    /// The session manager of a registered service, for broadcasting from
    /// outside any behavior.
    pub fn sessions(&self, path: &str) -> Option<Arc<crate::session::SessionManager>> {
        self.services
            .get(&normalize_path(path))
            .map(|host| host.sessions())
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address once the server is accepting (port 0 picks a free one);
    /// connections are handled on their own tasks.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, Error> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        let local_addr = listener.local_addr()?;
        info!("websocket server listening on {}", local_addr);

        self.running.store(true, Ordering::Release);
        for entry in self.services.iter() {
            entry.value().start();
        }

        let services = Arc::clone(&self.services);
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        debug!("accepted connection from {}", peer);
                        let services = Arc::clone(&services);
                        let config = config.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, services, config).await {
                                debug!("connection from {} ended with error: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => {
                        error!("accept error: {}", err);
                        continue;
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap() = Some(handle);

        Ok(local_addr)
    }

    /// Drains every service with the given close status, then stops the
    /// accept loop.
    pub async fn stop(&self, code: u16, reason: &str) {
        self.running.store(false, Ordering::Release);

        // Shard guards must not live across an await; snapshot the hosts.
        let hosts: Vec<Arc<ServiceHost>> = self
            .services
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for host in hosts {
            host.stop(code, reason).await;
        }

        if let Some(handle) = self.accept_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Runs one accepted socket through TLS, the handshake interception
/// contract, service resolution and validators, then hands the live
/// connection to the service host. Frames are never touched here.
async fn handle_connection(
    stream: TcpStream,
    services: Arc<DashMap<String, Arc<ServiceHost>>>,
    config: ServerConfig,
) -> Result<(), Error> {
    let stream = match &config.tls_config {
        Some(tls_config) => {
            let acceptor = TlsAcceptor::from(Arc::clone(tls_config));
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|err| Error::Tls(err.to_string()))?;
            MeshStream::Secure(TlsStream::from(tls_stream))
        }
        None => MeshStream::Plain(stream),
    };

    let (read_half, mut write_half) = split(stream);
    let mut buf_reader = BufReader::new(read_half);

    let request = HttpRequest::read_from(&mut buf_reader, config.handshake_timeout()).await?;

    // The generic HTTP surface is not this server's business: anything
    // that isn't a WebSocket upgrade is answered 400 and dropped.
    if let Err(error) = validate_upgrade_request(&request) {
        let response = match error {
            Error::UnsupportedWebsocketVersion(_) => {
                "HTTP/1.1 400 Bad Request\r\nSec-WebSocket-Version: 13\r\nContent-Length: 0\r\n\r\n"
                    .to_string()
            }
            _ => http_error_response(400, "Bad Request"),
        };
        let _ = write_half.write_all(response.as_bytes()).await;
        return Err(error);
    }

    let path = normalize_path(&request.uri);
    let host = match services.get(&path) {
        Some(entry) => Arc::clone(entry.value()),
        None => {
            let _ = write_half
                .write_all(http_error_response(404, "Not Found").as_bytes())
                .await;
            return Err(Error::ServiceNotFound(path));
        }
    };

    let behavior = host.new_behavior();

    if !behavior.validate_origin(request.header("origin"))
        || !behavior.validate_cookies(request.header("cookie"))
    {
        let _ = write_half
            .write_all(http_error_response(403, "Forbidden").as_bytes())
            .await;
        return Err(Error::RejectedByValidator);
    }

    if !behavior.validate_credentials(request.header("authorization")) {
        let _ = write_half
            .write_all(http_error_response(401, "Unauthorized").as_bytes())
            .await;
        return Err(Error::RejectedByValidator);
    }

    if !host.sessions().accepting() {
        let _ = write_half
            .write_all(http_error_response(503, "Service Unavailable").as_bytes())
            .await;
        return Err(Error::ManagerNotAccepting);
    }

    let key = request
        .header("sec-websocket-key")
        .ok_or(Error::NoSecWebsocketKey)?;
    let accept_value = generate_websocket_accept_value(key);

    // The echoed subprotocol must be one the client offered; the behavior
    // picks it.
    let offered: Vec<&str> = request
        .header("sec-websocket-protocol")
        .map(|header| header.split(',').map(str::trim).collect())
        .unwrap_or_default();
    let subprotocol = behavior.select_subprotocol(&offered);

    let mut web_socket_config = config.web_socket_config.clone();
    if let Some(wait_time) = host.options().wait_time {
        web_socket_config.close_timeout = Some(wait_time);
    }

    let extensions = negotiate_extensions(
        web_socket_config.extensions.clone(),
        request.header("sec-websocket-extensions"),
    )?;

    let response = build_accept_response(&accept_value, subprotocol.as_deref(), extensions.as_ref());
    write_half.write_all(response.as_bytes()).await?;

    let connection = establish(
        buf_reader,
        write_half,
        WriterKind::Server,
        web_socket_config,
        extensions,
        subprotocol,
    );

    let (reader, writer) = connection.split();
    let core = writer.core();
    let writer = Arc::new(Mutex::new(writer));

    let session_id = generate_session_id();
    let session = Session::new(session_id.clone(), Arc::clone(&writer), Arc::clone(&core));
    let handle = SessionHandle::new(session_id, writer, core, host.sessions());

    host.run_session(behavior, session, handle, reader).await
}

/// Registry keys are URL-decoded absolute paths with the trailing slash
/// trimmed, so `/chat/` and `/chat` resolve to the same service.
fn normalize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    let decoded = percent_decode(path);
    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok());
            if let Some(byte) = hex {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
