//! Chunk framing: `[chunk bytes] ++ [4-byte big-endian CRC32 of chunk bytes]`.
//!
//! Chunks carry no sequence number. Ordering and gap handling belong to the
//! receiver's reassembler.

use super::checksum::{CHECKSUM_LEN, Crc32};
use crate::error::{IntegrityFault, Result};

/// Appends the checksum trailer to `chunk` inside `out`.
///
/// `out` is cleared first so a send buffer can be reused across chunks.
pub fn seal_into(chunk: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(chunk.len() + CHECKSUM_LEN);
    out.extend_from_slice(chunk);
    out.extend_from_slice(&Crc32::trailer(chunk));
}

pub fn seal(chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    seal_into(chunk, &mut out);
    out
}

/// Splits off and verifies the trailer, returning the chunk bytes.
pub fn open(datagram: &[u8]) -> Result<&[u8]> {
    if datagram.len() < CHECKSUM_LEN {
        return Err(IntegrityFault::Undersized { len: datagram.len() }.into());
    }

    let (chunk, trailer) = datagram.split_at(datagram.len() - CHECKSUM_LEN);
    let expected = Crc32::read_trailer([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = Crc32::compute(chunk);

    if expected != actual {
        return Err(IntegrityFault::ChecksumMismatch { expected, actual }.into());
    }

    Ok(chunk)
}

/// Splits `payload` into pieces of at most `max_chunk` bytes.
///
/// An empty payload yields no chunks.
pub fn split(payload: &[u8], max_chunk: usize) -> impl Iterator<Item = &[u8]> {
    payload.chunks(max_chunk.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_seal_then_open() {
        let sealed = seal(b"jpeg bytes");
        assert_eq!(sealed.len(), 10 + CHECKSUM_LEN);
        assert_eq!(open(&sealed).unwrap(), b"jpeg bytes");
    }

    #[test]
    fn test_empty_chunk_is_valid() {
        let sealed = seal(&[]);
        assert_eq!(sealed, Crc32::trailer(&[]).to_vec());
        assert!(open(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_byte_rejected() {
        let mut sealed = seal(b"frame body");
        sealed[3] ^= 0x40;

        match open(&sealed) {
            Err(Error::Integrity(IntegrityFault::ChecksumMismatch { .. })) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_undersized_rejected() {
        match open(&[0x01, 0x02, 0x03]) {
            Err(Error::Integrity(IntegrityFault::Undersized { len: 3 })) => {}
            other => panic!("expected undersized, got {:?}", other),
        }
    }

    #[test]
    fn test_split_sizes() {
        let payload = vec![7u8; 150_000];
        let sizes: Vec<usize> = split(&payload, 64_996).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![64_996, 64_996, 20_008]);
        assert_eq!(split(&[], 10).count(), 0);
    }
}
