use crate::error::Error;

/// Streaming UTF-8 validation for fragmented text messages. A code point
/// may be split across fragment boundaries, so up to three trailing bytes
/// are carried over and re-checked when the next fragment arrives.
#[derive(Default)]
pub(crate) struct Utf8Validator {
    pending: Vec<u8>,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates one fragment's payload. Fails as soon as a byte sequence
    /// can no longer begin a valid code point, without waiting for the
    /// final fragment.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<(), Error> {
        if !self.pending.is_empty() {
            // Finish the code point left over from the previous fragment
            // one byte at a time. A UTF-8 sequence is at most 4 bytes.
            while !chunk.is_empty() {
                self.pending.push(chunk[0]);
                chunk = &chunk[1..];
                match std::str::from_utf8(&self.pending) {
                    Ok(_) => {
                        self.pending.clear();
                        break;
                    }
                    Err(err) if err.error_len().is_some() => return Err(Error::InvalidUtf8),
                    Err(_) => {
                        if self.pending.len() >= 4 {
                            return Err(Error::InvalidUtf8);
                        }
                    }
                }
            }
            if !self.pending.is_empty() {
                // Chunk exhausted while still inside the code point.
                return Ok(());
            }
        }

        match std::str::from_utf8(chunk) {
            Ok(_) => Ok(()),
            Err(err) if err.error_len().is_some() => Err(Error::InvalidUtf8),
            Err(err) => {
                self.pending.extend_from_slice(&chunk[err.valid_up_to()..]);
                Ok(())
            }
        }
    }

    /// Called on the final fragment: a dangling partial code point means
    /// the message as a whole was not valid UTF-8.
    pub fn finish(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            self.pending.clear();
            Err(Error::InvalidUtf8)
        }
    }
}
