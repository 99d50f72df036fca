use crate::error::Error;
use crate::frame::{apply_mask, Frame};
use crate::stream::MeshStream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWriteExt, WriteHalf};

#[derive(Clone, Copy)]
pub enum WriterKind {
    Client,
    Server,
}

/// Owns the write half of the stream. Every frame leaves through one
/// `write_frame` call under the connection's writer lock, so frame bytes
/// are contiguous on the wire and frames never interleave.
pub struct Writer {
    write_half: WriteHalf<MeshStream>,
    kind: WriterKind,
}

impl Writer {
    pub fn new(write_half: WriteHalf<MeshStream>, kind: WriterKind) -> Self {
        Self { write_half, kind }
    }

    pub async fn write_frame(&mut self, frame: Frame, set_rsv1: bool) -> Result<(), Error> {
        match self.kind {
            WriterKind::Client => self.write_frame_client(frame, set_rsv1).await,
            WriterKind::Server => self.write_frame_server(frame, set_rsv1).await,
        }
    }

    /// Tears the transport down once the close handshake has finished or
    /// given up.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.write_half.shutdown().await?;
        Ok(())
    }

    // The first byte of a websockets frame contains the final fragment bit,
    // the RSV flags and the OpCode. (frame.final_fragment as u8) << 7 sets
    // the top bit when this frame finishes a message, and RSV1 (0x40) marks
    // the first frame of a compressed message.
    fn first_byte(frame: &Frame, set_rsv1: bool) -> u8 {
        let mut first_byte = (frame.final_fragment as u8) << 7 | frame.opcode.as_u8();
        if set_rsv1 {
            first_byte |= 0x40;
        }
        first_byte
    }

    // According to the WebSockets RFC, if the payload length is less or
    // equal 125, it's written in the 7-bit field directly; up to 65535 it's
    // the marker 126 plus 2 big-endian bytes; beyond that the marker 127
    // plus 8 big-endian bytes.
    fn extend_payload_length(header: &mut Vec<u8>, payload_len: usize, mask_bit: u8) {
        if payload_len <= 125 {
            header.push(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            header.push(mask_bit | 126);
            header.extend_from_slice(&(payload_len as u16).to_be_bytes());
        } else {
            header.push(mask_bit | 127);
            header.extend_from_slice(&(payload_len as u64).to_be_bytes());
        }
    }

    async fn write_frame_server(&mut self, frame: Frame, set_rsv1: bool) -> Result<(), Error> {
        let mut header = Vec::with_capacity(10);
        header.push(Self::first_byte(&frame, set_rsv1));
        Self::extend_payload_length(&mut header, frame.payload.len(), 0);

        self.write_half.write_all(&header).await?;
        self.write_half.write_all(&frame.payload).await?;

        Ok(())
    }

    // Method used for writing frames into the socket by clients. According
    // to the WebSockets RFC, all frames sent from the client need to have
    // the payload masked with a fresh 4-byte key.
    async fn write_frame_client(&mut self, frame: Frame, set_rsv1: bool) -> Result<(), Error> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let mask: [u8; 4] = rng.random();

        let mut header = Vec::with_capacity(14);
        header.push(Self::first_byte(&frame, set_rsv1));
        // we set the MSB of the length byte to signify that the payload is masked
        Self::extend_payload_length(&mut header, frame.payload.len(), 0b1000_0000);
        header.extend_from_slice(&mask);

        let mut masked_payload = frame.payload;
        apply_mask(&mut masked_payload, mask);

        self.write_half.write_all(&header).await?;
        self.write_half.write_all(&masked_payload).await?;

        Ok(())
    }
}
