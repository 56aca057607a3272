//! Binary framing shared by the streaming decoder and download chunks
//!
//! Every binary unit starts with one 4-byte header word, big-endian, whose
//! bit 0 is the final flag. On byte-stream channels bits 1-31 carry the payload
//! length and [`FrameDecoder`] reassembles frames across arbitrary splits. On
//! message-aligned channels (download data) a transport message is exactly one
//! frame, so only the final bit is read and the rest of the message is payload.

use anyhow::{bail, Result};

/// Header size in bytes
pub const HEADER_LEN: usize = 4;

const FINAL_FLAG: u32 = 1;

/// Byte prefixed to upload chunks that could be mistaken for control traffic
pub const CHUNK_ESCAPE: u8 = 0x00;

/// Validate frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > crate::protocol::MAX_FRAME_SIZE {
        bail!(
            "frame payload too large: {} bytes (max: {})",
            size,
            crate::protocol::MAX_FRAME_SIZE
        );
    }
    Ok(())
}

/// Build a length-carrying header
/// Format: (LENGTH << 1 | FINAL) as u32 big-endian
pub fn build_frame_header(payload_len: usize, is_final: bool) -> Result<[u8; HEADER_LEN]> {
    validate_frame_size(payload_len)?;
    let raw = ((payload_len as u32) << 1) | if is_final { FINAL_FLAG } else { 0 };
    Ok(raw.to_be_bytes())
}

/// Parse a length-carrying header
/// Returns: (payload_length, final)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> (usize, bool) {
    let raw = u32::from_be_bytes(*header);
    ((raw >> 1) as usize, raw & FINAL_FLAG != 0)
}

/// Encode one frame (header + payload) for a byte-stream channel
pub fn encode_frame(payload: &[u8], is_final: bool) -> Result<Vec<u8>> {
    let header = build_frame_header(payload.len(), is_final)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Split a message-aligned download chunk into (payload, final).
/// Only bit 0 of the header word is meaningful here; the agent uses the
/// remaining bits as flags, not as a length.
pub fn split_chunk_message(message: &[u8]) -> Option<(&[u8], bool)> {
    if message.len() < HEADER_LEN {
        return None;
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&message[..HEADER_LEN]);
    let raw = u32::from_be_bytes(header);
    Some((&message[HEADER_LEN..], raw & FINAL_FLAG != 0))
}

/// Prefix an upload chunk with [`CHUNK_ESCAPE`] when its first byte is `0x00`
/// or `{`, so the agent never reads it as a control or JSON message.
pub fn prepare_upload_chunk(chunk: &[u8]) -> Vec<u8> {
    match chunk.first() {
        Some(&b) if b == CHUNK_ESCAPE || b == b'{' => {
            let mut out = Vec::with_capacity(chunk.len() + 1);
            out.push(CHUNK_ESCAPE);
            out.extend_from_slice(chunk);
            out
        }
        _ => chunk.to_vec(),
    }
}

/// True when a binary message is plausibly JSON text rather than file data
pub fn looks_like_json(bytes: &[u8]) -> bool {
    matches!(bytes.first(), Some(b'{') | Some(b'['))
}

/// Incremental decoder for length-carrying frames on a byte-stream channel.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and hand every complete frame to `on_chunk` in order.
    /// A frame whose declared length exceeds the limit poisons the stream:
    /// the buffer is dropped and an error returned.
    pub fn push<F>(&mut self, data: &[u8], mut on_chunk: F) -> Result<()>
    where
        F: FnMut(&[u8], bool),
    {
        if data.is_empty() {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);

        let mut consumed = 0;
        while self.buffer.len() - consumed >= HEADER_LEN {
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&self.buffer[consumed..consumed + HEADER_LEN]);
            let (len, is_final) = parse_frame_header(&header);
            if let Err(e) = validate_frame_size(len) {
                self.buffer.clear();
                return Err(e);
            }
            let end = consumed + HEADER_LEN + len;
            if self.buffer.len() < end {
                break;
            }
            on_chunk(&self.buffer[consumed + HEADER_LEN..end], is_final);
            consumed = end;
        }
        self.buffer.drain(..consumed);
        Ok(())
    }

    /// Bytes held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop partial state so the decoder can be reused after a reconnect
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
