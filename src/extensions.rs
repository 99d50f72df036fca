use crate::error::Error;

const PERMESSAGE_DEFLATE: &str = "permessage-deflate";
const CLIENT_NO_CONTEXT_TAKEOVER: &str = "client_no_context_takeover";
const SERVER_NO_CONTEXT_TAKEOVER: &str = "server_no_context_takeover";
const CLIENT_MAX_WINDOW_BITS: &str = "client_max_window_bits";
const SERVER_MAX_WINDOW_BITS: &str = "server_max_window_bits";

/// Negotiated permessage-deflate parameters. The context-takeover flags are
/// parsed and merged so the negotiation echoes what both sides agreed on,
/// but the codecs always behave statelessly: contexts are reset between
/// messages in both directions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extensions {
    /// Dictates if compression is enabled
    pub permessage_deflate: bool,
    /// Asks the compressing side to reset its context after each message
    /// sent client-to-server.
    pub client_no_context_takeover: Option<bool>,
    /// Asks the compressing side to reset its context after each message
    /// sent server-to-client.
    pub server_no_context_takeover: Option<bool>,
    /// Caps the window size the client compresses with.
    pub client_max_window_bits: Option<u8>,
    /// Caps the window size the server compresses with.
    pub server_max_window_bits: Option<u8>,
}

impl Extensions {
    /// The simplest offer: bare permessage-deflate, no parameters.
    pub fn deflate() -> Self {
        Extensions {
            permessage_deflate: true,
            ..Default::default()
        }
    }

    /// Parses a Sec-WebSocket-Extensions header value. Returns `None` when
    /// the header doesn't offer permessage-deflate at all.
    pub fn parse(header_value: &str) -> Option<Self> {
        let mut extensions = Extensions::default();

        for part in header_value.split(';') {
            let part = part.trim();
            if part == PERMESSAGE_DEFLATE {
                extensions.permessage_deflate = true;
            } else if part.starts_with(CLIENT_NO_CONTEXT_TAKEOVER) {
                extensions.client_no_context_takeover = Some(true);
            } else if part.starts_with(SERVER_NO_CONTEXT_TAKEOVER) {
                extensions.server_no_context_takeover = Some(true);
            } else if part.starts_with(CLIENT_MAX_WINDOW_BITS) {
                extensions.client_max_window_bits = Self::parse_window_bits(part);
            } else if part.starts_with(SERVER_MAX_WINDOW_BITS) {
                extensions.server_max_window_bits = Self::parse_window_bits(part);
            }
        }

        if !extensions.permessage_deflate {
            return None;
        }

        Some(extensions)
    }

    fn parse_window_bits(part: &str) -> Option<u8> {
        if !part.contains('=') {
            Some(15)
        } else {
            part.split('=').next_back()?.trim().parse::<u8>().ok()
        }
    }

    /// Window bit parameters outside 8..=15 fail the negotiation.
    pub fn validate(&self) -> Result<(), Error> {
        for bits in [self.client_max_window_bits, self.server_max_window_bits]
            .into_iter()
            .flatten()
        {
            if !(8..=15).contains(&bits) {
                return Err(Error::InvalidMaxWindowBits);
            }
        }
        Ok(())
    }

    /// Intersects what the local side offers with what the peer asked for.
    /// Compression is only on when both sides offered it; window caps take
    /// the smaller of the two requests.
    pub fn merge(local: Option<Extensions>, peer: Option<Extensions>) -> Option<Extensions> {
        let local = local?;
        let peer = peer?;

        let min_bits = |a: Option<u8>, b: Option<u8>| match (a, b) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let merged = Extensions {
            permessage_deflate: local.permessage_deflate && peer.permessage_deflate,
            client_no_context_takeover: local
                .client_no_context_takeover
                .and(peer.client_no_context_takeover),
            server_no_context_takeover: local
                .server_no_context_takeover
                .and(peer.server_no_context_takeover),
            client_max_window_bits: min_bits(local.client_max_window_bits, peer.client_max_window_bits),
            server_max_window_bits: min_bits(local.server_max_window_bits, peer.server_max_window_bits),
        };

        if !merged.permessage_deflate {
            return None;
        }

        Some(merged)
    }

    /// The header value this negotiation result serializes to, shared by the
    /// client offer and the server echo.
    pub fn header_value(&self) -> String {
        let mut value = String::from(PERMESSAGE_DEFLATE);
        if let Some(true) = self.client_no_context_takeover {
            value.push_str(&format!("; {}", CLIENT_NO_CONTEXT_TAKEOVER));
        }
        if let Some(true) = self.server_no_context_takeover {
            value.push_str(&format!("; {}", SERVER_NO_CONTEXT_TAKEOVER));
        }
        if let Some(bits) = self.client_max_window_bits {
            value.push_str(&format!("; {}={}", CLIENT_MAX_WINDOW_BITS, bits));
        }
        if let Some(bits) = self.server_max_window_bits {
            value.push_str(&format!("; {}={}", SERVER_MAX_WINDOW_BITS, bits));
        }
        value
    }
}
