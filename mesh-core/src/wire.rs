//! Framing: length-prefix (4 bytes LE) + JSON payload.

use crate::protocol::Envelope;

const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into a single frame: 4 bytes LE length + JSON payload.
pub fn encode_frame(env: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(env).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding an envelope into a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Split one frame off the front of `bytes`. Returns the payload and the number of bytes consumed.
pub fn split_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Parse a frame payload (without its length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<Envelope, FrameDecodeError> {
    serde_json::from_slice(payload).map_err(FrameDecodeError::Decode)
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    let (payload, consumed) = split_frame(bytes)?;
    Ok((decode_payload(payload)?, consumed))
}

/// Error decoding a frame (need more bytes, too large, or malformed JSON).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Reassembles frames from arbitrarily fragmented or coalesced stream reads.
///
/// Feed every read with [`FrameDecoder::extend`], then drain complete payloads with
/// [`FrameDecoder::next_frame`] until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete payload, or `Ok(None)` if more bytes are needed.
    ///
    /// `TooLarge` is unrecoverable: the stream cannot be resynchronised after a bad length prefix.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameDecodeError> {
        match split_frame(&self.buf) {
            Ok((payload, consumed)) => {
                let payload = payload.to_vec();
                self.buf.drain(..consumed);
                Ok(Some(payload))
            }
            Err(FrameDecodeError::NeedMore) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
