use crate::error::Error;

/// Control frames carry at most 125 payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;
/// Close reasons leave two bytes of the control payload for the status code.
pub const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// Close status codes per RFC 6455 section 7.4.1.
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Reserved, signals "no status code present". Never written to the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Reserved, signals abnormal closure. Never written to the wire.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Reserved, signals a TLS handshake failure. Never written to the wire.
    pub const TLS_HANDSHAKE: u16 = 1015;

    /// Codes that designate meanings outside the wire protocol and must not
    /// appear in a close frame.
    pub fn is_reserved(code: u16) -> bool {
        matches!(
            code,
            CloseCode::NO_STATUS | CloseCode::ABNORMAL | CloseCode::TLS_HANDSHAKE
        )
    }
}

/// Decoded body of a close frame: 16-bit status code plus a UTF-8 reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosePayload {
    pub code: u16,
    pub reason: String,
}

impl ClosePayload {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Decodes a close frame body. An empty body means the peer sent no
    /// status, which surfaces as 1005. A one-byte body and a reason that is
    /// not UTF-8 are both payload violations.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, Error> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::InvalidPayloadLength),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = String::from_utf8(payload[2..].to_vec())?;
                Ok(Some(ClosePayload { code, reason }))
            }
        }
    }

    /// Encodes the status code big-endian followed by the reason, truncated
    /// so the whole body stays within the control frame limit.
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason_bytes = self.reason.as_bytes();
        let truncated = reason_bytes.len().min(MAX_CLOSE_REASON);
        let mut bytes = Vec::with_capacity(2 + truncated);
        bytes.extend_from_slice(&self.code.to_be_bytes());
        bytes.extend_from_slice(&reason_bytes[..truncated]);
        bytes
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
    pub compressed: bool,
}

impl Frame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>, compressed: bool) -> Self {
        Self {
            final_fragment,
            opcode,
            payload,
            compressed,
        }
    }

    /// A close frame carrying `code` and `reason`. Reserved codes are
    /// refused here so they can never reach the wire.
    pub fn close(code: u16, reason: &str) -> Result<Self, Error> {
        if CloseCode::is_reserved(code) {
            return Err(Error::InvalidCloseCode(code));
        }
        let payload = ClosePayload::new(code, reason).to_bytes();
        Ok(Frame::new(true, OpCode::Close, payload, false))
    }

    /// A bare close frame with no status code.
    pub fn close_empty() -> Self {
        Frame::new(true, OpCode::Close, Vec::new(), false)
    }

    pub fn ping(payload: Vec<u8>) -> Result<Self, Error> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFramePayloadSize);
        }
        Ok(Frame::new(true, OpCode::Ping, payload, false))
    }

    pub fn pong(payload: Vec<u8>) -> Result<Self, Error> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlFramePayloadSize);
        }
        Ok(Frame::new(true, OpCode::Pong, payload, false))
    }
}

/// XOR each payload byte with `mask[i % 4]`. Applying the same key twice
/// restores the original bytes, so masking and unmasking share this path.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
