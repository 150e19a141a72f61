//! Chunk math and integrity: split files into checksummed pieces, honor
//! resume offsets.

use sha2::{Digest, Sha256};

/// Default chunk size. A config, not a constant: the receiver may dictate a
/// different size at session init.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024; // 1 MiB

/// One planned chunk of a file: byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub offset: u64,
    pub len: u64,
}

/// Plan the chunks for a file of `file_len` bytes, starting at
/// `resume_offset` (bytes before it are already on the receiver's disk and
/// must not be re-sent). `chunk_size == 0` falls back to the default.
pub fn plan_chunks(file_len: u64, chunk_size: u64, resume_offset: u64) -> Vec<ChunkSpec> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::new();
    let mut offset = resume_offset.min(file_len);
    while offset < file_len {
        let len = (file_len - offset).min(size);
        out.push(ChunkSpec { offset, len });
        offset += len;
    }
    out
}

/// SHA-256 of a chunk payload.
pub fn checksum(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify a chunk payload against its declared checksum.
pub fn verify(payload: &[u8], expected: &[u8; 32]) -> bool {
    checksum(payload) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_uneven_split() {
        let chunks = plan_chunks(100, 30, 0);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ChunkSpec { offset: 0, len: 30 });
        assert_eq!(chunks[3], ChunkSpec { offset: 90, len: 10 });
    }

    #[test]
    fn plan_exact_multiple() {
        let chunks = plan_chunks(90, 30, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], ChunkSpec { offset: 60, len: 30 });
    }

    #[test]
    fn plan_zero_length_file() {
        assert!(plan_chunks(0, 30, 0).is_empty());
    }

    #[test]
    fn plan_zero_chunk_size_uses_default() {
        let chunks = plan_chunks(DEFAULT_CHUNK_SIZE * 2, 0, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn plan_honors_resume_offset() {
        let chunks = plan_chunks(100, 30, 45);
        assert_eq!(chunks[0], ChunkSpec { offset: 45, len: 30 });
        let covered: u64 = chunks.iter().map(|c| c.len).sum();
        assert_eq!(covered, 55);
        assert!(chunks.iter().all(|c| c.offset >= 45));
    }

    #[test]
    fn plan_resume_past_end_is_empty() {
        assert!(plan_chunks(100, 30, 100).is_empty());
        assert!(plan_chunks(100, 30, 150).is_empty());
    }

    #[test]
    fn largest_file_of_scenario_splits_into_three() {
        // 2,000,000-byte file at the 1 MiB default: two full chunks and one
        // partial remainder.
        let chunks = plan_chunks(2_000_000, DEFAULT_CHUNK_SIZE, 0);
        assert_eq!(chunks.len(), 2);
        let chunks = plan_chunks(2_500_000, DEFAULT_CHUNK_SIZE, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks[1].len, DEFAULT_CHUNK_SIZE);
        assert_eq!(chunks[2].len, 2_500_000 - 2 * DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn checksum_verify_roundtrip() {
        let payload = b"hello chunk";
        let sum = checksum(payload);
        assert!(verify(payload, &sum));
        assert!(!verify(b"tampered", &sum));
    }
}
