//! Core data structures shared by both transport families.
//!
//! - Checksum: CRC32 used in chunk trailers
//! - Chunk: sealing, verification and splitting of media payloads
//! - Document: BSON-encoded telemetry/control mappings
//! - Datagram: multiplexing documents and chunks on one socket

mod checksum;
pub mod chunk;
mod datagram;
mod document;

pub use checksum::{CHECKSUM_LEN, Crc32};
pub use datagram::{Framing, Inbound, TAG_CHUNK, TAG_DOCUMENT};
pub use document::Document;
