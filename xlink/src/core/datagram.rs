//! Datagram multiplexing between whole documents and checksummed chunks.
//!
//! ```text
//! tagged:    ┌─────┬──────────────────────────────┐
//!            │ 0x01│ BSON document                │
//!            ├─────┼─────────────────┬────────────┤
//!            │ 0x02│ chunk bytes     │ CRC32 (BE) │
//!            └─────┴─────────────────┴────────────┘
//!
//! untagged:  BSON document            (tried first)
//!            chunk bytes ++ CRC32 (BE) (otherwise)
//! ```
//!
//! Untagged framing is what the existing sensor and camera nodes send. A
//! datagram counts as a document only when its BSON length prefix covers it
//! exactly and it decodes; JPEG chunk data practically never does, but nothing
//! guarantees it, so tagged framing is the default.

use std::fmt;
use std::str::FromStr;

use super::checksum::{CHECKSUM_LEN, Crc32};
use super::chunk;
use super::document::Document;
use crate::error::{Error, Result};

pub const TAG_DOCUMENT: u8 = 0x01;
pub const TAG_CHUNK: u8 = 0x02;

/// How document and chunk datagrams are told apart on one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One leading type byte on every datagram.
    #[default]
    Tagged,
    /// Heuristic: attempt a document decode, else treat as a chunk.
    Untagged,
}

impl Framing {
    /// Bytes added in front of every datagram body.
    pub const fn overhead(self) -> usize {
        match self {
            Framing::Tagged => 1,
            Framing::Untagged => 0,
        }
    }

    /// Largest chunk that fits a datagram of `max_datagram` bytes.
    pub const fn max_chunk_len(self, max_datagram: usize) -> usize {
        max_datagram.saturating_sub(CHECKSUM_LEN + self.overhead())
    }

    pub fn encode_chunk(self, chunk_bytes: &[u8], out: &mut Vec<u8>) {
        match self {
            Framing::Tagged => {
                out.clear();
                out.reserve(1 + chunk_bytes.len() + CHECKSUM_LEN);
                out.push(TAG_CHUNK);
                out.extend_from_slice(chunk_bytes);
                out.extend_from_slice(&Crc32::trailer(chunk_bytes));
            }
            Framing::Untagged => chunk::seal_into(chunk_bytes, out),
        }
    }

    pub fn encode_document(self, document: &Document) -> Result<Vec<u8>> {
        let body = document.encode()?;
        Ok(match self {
            Framing::Tagged => {
                let mut out = Vec::with_capacity(body.len() + 1);
                out.push(TAG_DOCUMENT);
                out.extend_from_slice(&body);
                out
            }
            Framing::Untagged => body,
        })
    }

    /// Classifies a received datagram.
    pub fn classify(self, datagram: &[u8]) -> Inbound<'_> {
        match self {
            Framing::Tagged => match datagram.split_first() {
                Some((&TAG_DOCUMENT, body)) => match Document::decode(body) {
                    Ok(document) => Inbound::Document(document),
                    Err(e) => Inbound::Rejected(e),
                },
                Some((&TAG_CHUNK, body)) => match chunk::open(body) {
                    Ok(bytes) => Inbound::Chunk(bytes),
                    Err(e) => Inbound::Rejected(e),
                },
                Some((&tag, _)) => Inbound::Unknown(tag),
                None => Inbound::Rejected(Error::Integrity(
                    crate::error::IntegrityFault::Undersized { len: 0 },
                )),
            },
            Framing::Untagged => {
                if let Ok(document) = Document::decode(datagram) {
                    return Inbound::Document(document);
                }
                match chunk::open(datagram) {
                    Ok(bytes) => Inbound::Chunk(bytes),
                    Err(e) => Inbound::Rejected(e),
                }
            }
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Tagged => write!(f, "tagged"),
            Framing::Untagged => write!(f, "untagged"),
        }
    }
}

impl FromStr for Framing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tagged" => Ok(Framing::Tagged),
            "untagged" | "legacy" => Ok(Framing::Untagged),
            other => Err(Error::Configuration(format!(
                "unknown framing '{}' (expected tagged or untagged)",
                other
            ))),
        }
    }
}

/// A classified datagram.
#[derive(Debug)]
pub enum Inbound<'a> {
    Document(Document),
    /// Checksum-verified chunk bytes, trailer removed.
    Chunk(&'a [u8]),
    /// Failed integrity or document decode.
    Rejected(Error),
    /// Tagged datagram with a type byte this build does not know.
    Unknown(u8),
}
