use crate::error::Error;
use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Sync-flush marker that terminates every deflate block sequence. The
/// sender trims it from the compressed message; the receiver appends it
/// back before inflating (RFC 7692 section 7.2.1).
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

// miniz only supports window sizes of 9..=15 bits, while the extension
// negotiation allows 8. An 8-bit window request still decodes correctly
// with the next size up.
fn effective_window_bits(window_bits: Option<u8>) -> Option<u8> {
    window_bits.map(|bits| bits.max(9))
}

fn calculate_buffer_size(payload_size: usize) -> usize {
    if payload_size <= 4096 {
        4096 // 4 KB for small payloads
    } else if payload_size <= 65536 {
        16384 // 16 KB for medium payloads
    } else {
        65536 // 64 KB for large payloads
    }
}

pub(crate) struct Encoder {
    compressor: Compress,
    reset_context: bool,
}

impl Encoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let compressor = match effective_window_bits(window_bits) {
            Some(bits) => Compress::new_with_window_bits(Compression::default(), false, bits),
            None => Compress::new(Compression::default(), false),
        };
        Self {
            compressor,
            reset_context,
        }
    }

    /// Deflates one whole message and trims the trailing sync-flush marker.
    /// Compression happens once per message, before any fragmentation.
    pub fn compress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if self.reset_context {
            self.compressor.reset();
        }

        let buffer_size = calculate_buffer_size(payload.len());
        let mut compressed = BytesMut::with_capacity(buffer_size);
        let mut buffer = Vec::with_capacity(buffer_size);

        let before_in = self.compressor.total_in();
        while self.compressor.total_in() - before_in < payload.len() as u64 {
            let consumed = (self.compressor.total_in() - before_in) as usize;
            self.compressor
                .compress_vec(&payload[consumed..], &mut buffer, FlushCompress::None)
                .map_err(|_| Error::DecompressionError)?;
            compressed.extend_from_slice(&buffer);
            buffer.clear();
        }

        // Sync-flush so the peer can inflate the message without a stream
        // end marker; the flush is complete once the trailer shows up.
        loop {
            let before_out = self.compressor.total_out();
            self.compressor
                .compress_vec(&[], &mut buffer, FlushCompress::Sync)
                .map_err(|_| Error::DecompressionError)?;
            compressed.extend_from_slice(&buffer);
            buffer.clear();
            if compressed.ends_with(&DEFLATE_TRAILER) {
                break;
            }
            if self.compressor.total_out() == before_out {
                return Err(Error::DecompressionError);
            }
        }
        compressed.truncate(compressed.len() - DEFLATE_TRAILER.len());

        Ok(compressed.to_vec())
    }
}

pub(crate) struct Decoder {
    decompressor: Decompress,
    reset_context: bool,
}

impl Decoder {
    pub fn new(reset_context: bool, window_bits: Option<u8>) -> Self {
        let decompressor = match effective_window_bits(window_bits) {
            Some(bits) => Decompress::new_with_window_bits(false, bits),
            None => Decompress::new(false),
        };
        Self {
            decompressor,
            reset_context,
        }
    }

    /// Inflates one whole message: the sync-flush trailer the sender
    /// trimmed is appended back first. Runs after all fragments have been
    /// reassembled.
    pub fn decompress(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let mut input = BytesMut::with_capacity(payload.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TRAILER);

        if self.reset_context {
            self.decompressor.reset(false);
        }

        // adjust the buffer size, depending on the payload,
        // for balancing between CPU vs. Memory usage
        let buffer_size = calculate_buffer_size(input.len());
        let mut decompressed = BytesMut::with_capacity(buffer_size);
        let mut buffer = Vec::with_capacity(buffer_size);

        let before_in = self.decompressor.total_in();
        while self.decompressor.total_in() - before_in < input.len() as u64 {
            let consumed = (self.decompressor.total_in() - before_in) as usize;
            let before_out = self.decompressor.total_out();
            match self
                .decompressor
                .decompress_vec(&input[consumed..], &mut buffer, FlushDecompress::Sync)
                .map_err(|_| Error::DecompressionError)?
            {
                Status::Ok | Status::BufError => {
                    decompressed.extend_from_slice(&buffer);
                    buffer.clear();
                    // A pass that moves no bytes in either direction means
                    // the input is malformed, not merely short.
                    if self.decompressor.total_in() - before_in == consumed as u64
                        && self.decompressor.total_out() == before_out
                    {
                        return Err(Error::DecompressionError);
                    }
                }
                Status::StreamEnd => {
                    decompressed.extend_from_slice(&buffer);
                    buffer.clear();
                    break;
                }
            }
        }

        // The scratch buffer may have filled on the pass that consumed the
        // last input byte; keep draining until inflate stops producing.
        loop {
            let before_out = self.decompressor.total_out();
            self.decompressor
                .decompress_vec(&[], &mut buffer, FlushDecompress::Sync)
                .map_err(|_| Error::DecompressionError)?;
            if self.decompressor.total_out() == before_out {
                break;
            }
            decompressed.extend_from_slice(&buffer);
            buffer.clear();
        }

        Ok(decompressed.to_vec())
    }
}
