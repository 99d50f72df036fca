use crate::extensions::Extensions;
use rustls::ServerConfig as RustlsConfig;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 << 20;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 << 20;
pub const DEFAULT_FRAGMENT_SIZE: usize = 16 * 1024;
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-connection protocol knobs. Every field falls back to the crate
/// default when left unset, so `WebSocketConfig::default()` with one field
/// overridden is the usual way to build one.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConfig {
    pub max_frame_size: Option<usize>,
    pub max_message_size: Option<usize>,
    /// Outbound messages larger than this are split into continuation frames.
    pub fragment_size: Option<usize>,
    /// How long a close handshake or a ping waits for the peer's answer.
    pub close_timeout: Option<Duration>,
    /// The permessage-deflate offer. `None` disables compression entirely.
    pub extensions: Option<Extensions>,
}

impl WebSocketConfig {
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size.unwrap_or(DEFAULT_FRAGMENT_SIZE)
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT)
    }
}

#[derive(Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: WebSocketConfig,
    /// When set, accepted sockets are wrapped in a TLS session before the
    /// handshake is read.
    pub tls_config: Option<Arc<RustlsConfig>>,
    /// How long an accepted socket may take to deliver its HTTP request.
    pub handshake_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
    /// Subprotocol names offered in Sec-WebSocket-Protocol, preference order.
    pub subprotocols: Vec<String>,
    /// Origin header value, when the caller acts on behalf of a browser context.
    pub origin: Option<String>,
    /// Extra headers appended verbatim to the handshake request, e.g. Cookie
    /// or Authorization pairs.
    pub headers: Vec<(String, String)>,
    /// Path to a PEM bundle overriding the webpki roots for wss connections.
    pub ca_file: Option<String>,
}
