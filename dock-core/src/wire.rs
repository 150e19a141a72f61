//! Binary chunk framing: 4 bytes LE length prefix + bincode body.
//!
//! Chunks ride on binary frames so large payloads never pass through the
//! textual envelope. One frame per chunk; chunks are never persisted.

use serde::{Deserialize, Serialize};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// One chunk on the wire: session, target file, offset, checksum, bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub session_id: String,
    /// Path relative to the session's destination directory.
    pub rel_path: String,
    /// Byte offset of `payload` within the destination file.
    pub offset: u64,
    /// SHA-256 of `payload`, verified by the receiver before any write.
    pub checksum: [u8; 32],
    pub payload: Vec<u8>,
}

/// Encode a chunk into a single frame: 4 bytes LE length + bincode body.
pub fn encode_chunk_frame(frame: &ChunkFrame) -> Result<Vec<u8>, FrameEncodeError> {
    let body = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding a chunk into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the chunk and the
/// number of bytes consumed. Call with a partial buffer; `NeedMore` means
/// try again after more data arrives.
pub fn decode_chunk_frame(bytes: &[u8]) -> Result<(ChunkFrame, usize), FrameDecodeError> {
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
    let frame: ChunkFrame = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::checksum;

    fn sample_chunk() -> ChunkFrame {
        let payload = vec![7u8; 512];
        ChunkFrame {
            session_id: "sess-1".into(),
            rel_path: "data/level.pak".into(),
            offset: 1_048_576,
            checksum: checksum(&payload),
            payload,
        }
    }

    #[test]
    fn roundtrip_chunk() {
        let chunk = sample_chunk();
        let frame = encode_chunk_frame(&chunk).unwrap();
        let (decoded, n) = decode_chunk_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded.session_id, chunk.session_id);
        assert_eq!(decoded.rel_path, chunk.rel_path);
        assert_eq!(decoded.offset, chunk.offset);
        assert_eq!(decoded.checksum, chunk.checksum);
        assert_eq!(decoded.payload, chunk.payload);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_chunk_frame(&sample_chunk()).unwrap();
        assert!(matches!(
            decode_chunk_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_chunk_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_buffer() {
        let a = sample_chunk();
        let mut b = sample_chunk();
        b.offset = 0;
        let fa = encode_chunk_frame(&a).unwrap();
        let fb = encode_chunk_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (c1, n1) = decode_chunk_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (c2, n2) = decode_chunk_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(c1.offset, 1_048_576);
        assert_eq!(c2.offset, 0);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_chunk_frame(&buf),
            Err(FrameDecodeError::TooLarge)
        ));
    }
}
