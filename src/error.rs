use httparse::Error as HttpParseError;
use pki_types::InvalidDnsNameError;
use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::ParseError;

use crate::frame::CloseCode;

#[derive(Error, Debug)]
pub enum Error {
    // Channel / task errors
    #[error("channel communication error")]
    CommunicationError,

    // General errors
    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("{source}")]
    FromUtf8Error {
        #[from]
        source: FromUtf8Error,
    },

    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    // Handshake errors
    #[error("Invalid handshake request method and version")]
    InvalidHTTPHandshake,

    #[error("Connection: Upgrade header missing in the request")]
    NoConnectionHeaderPresent,

    #[error("Upgrade: websocket header missing in the request")]
    NoUpgradeHeaderPresent,

    #[error("Host header missing in the request")]
    NoHostHeaderPresent,

    #[error("Couldn't find Sec-WebSocket-Key header in the request")]
    NoSecWebsocketKey,

    #[error("Couldn't find Sec-WebSocket-Version header in the request")]
    NoSecWebsocketVersion,

    #[error("Sec-WebSocket-Version `{0}` is not supported, only version 13")]
    UnsupportedWebsocketVersion(String),

    #[error("Server didn't upgrade the connection")]
    NoUpgrade,

    #[error("Server didn't send a valid Sec-WebSocket-Accept key")]
    InvalidAcceptKey,

    #[error("Server selected subprotocol `{0}` which was never offered")]
    SubprotocolNotOffered(String),

    #[error("Server sent Sec-WebSocket-Extensions but no extensions were offered")]
    ExtensionsNotOffered,

    #[error("no service registered under path `{0}`")]
    ServiceNotFound(String),

    #[error("handshake request rejected by a service validator")]
    RejectedByValidator,

    #[error("handshake failed, server answered with status {0}")]
    HandshakeFailed(u16),

    // Framing errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("64-bit payload length with the high bit set")]
    InvalidPayloadLength,

    #[error("frame mask bit does not match the peer's role")]
    InvalidMaskBit,

    #[error("fragment_size: `{0}` can't be greater than max_frame_size: `{1}`")]
    CustomFragmentSizeExceeded(usize, usize),

    #[error("Max frame size reached")]
    MaxFrameSize,

    #[error("Max message size reached")]
    MaxMessageSize,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    #[error("close frame carries a status code reserved for local use: {0}")]
    InvalidCloseCode(u16),

    // Fragmentation errors
    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Incoming fragmented message but there is one already in progress")]
    FragmentedInProgress,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    // Compression / decompression errors
    #[error("failed to inflate a permessage-deflate payload")]
    DecompressionError,

    #[error("max_window_bits should be a value between 8 and 15")]
    InvalidMaxWindowBits,

    // Connection state errors
    #[error("connection is closing, no further sends are accepted")]
    ConnectionClosing,

    #[error("connection is closed")]
    ConnectionClosed,

    // Session errors
    #[error("session `{0}` already registered in this service")]
    SessionAlreadyExists(String),

    #[error("session manager is not accepting new sessions")]
    ManagerNotAccepting,

    // HTTP errors
    #[error("{source}")]
    URLParseError {
        #[from]
        source: ParseError,
    },

    #[error("Invalid scheme in WebSocket URL")]
    InvalidSchemeURL,

    #[error("URL has no host")]
    URLNoHost,

    #[error("{source}")]
    HttpParseError {
        #[from]
        source: HttpParseError,
    },

    #[error("Incomplete HTTP request")]
    IncompleteHTTPRequest,

    #[error("malformed HTTP response")]
    InvalidHTTPResponse,

    // Domain addr parsing error
    #[error("{source}")]
    DomainError {
        #[from]
        source: InvalidDnsNameError,
    },

    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// The RFC 6455 status code this error maps to when it tears the
    /// connection down. Reserved codes (1006) are kept local, never written
    /// to the wire.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::RSVNotZero
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::InvalidPayloadLength
            | Error::InvalidMaskBit
            | Error::InvalidOpcode
            | Error::InvalidCloseCode(_)
            | Error::InvalidFrameFragmentation
            | Error::FragmentedInProgress
            | Error::InvalidContinuationFrame => CloseCode::PROTOCOL_ERROR,
            Error::FromUtf8Error { .. } | Error::InvalidUtf8 | Error::DecompressionError => {
                CloseCode::INVALID_PAYLOAD
            }
            Error::MaxFrameSize | Error::MaxMessageSize | Error::CustomFragmentSizeExceeded(_, _) => {
                CloseCode::TOO_BIG
            }
            Error::RejectedByValidator => CloseCode::POLICY_VIOLATION,
            Error::IOError { .. } | Error::Timeout { .. } => CloseCode::ABNORMAL,
            _ => CloseCode::INTERNAL_ERROR,
        }
    }
}
