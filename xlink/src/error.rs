use core::fmt;

use thiserror::Error as ThisError;

/// Coarse classification of an [`Error`], mirroring the transport taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    ConnectionState,
    Transport,
    Integrity,
    Decode,
    Oversize,
    Sequence,
    Unavailable,
    RetryExhausted,
}

/// Why a datagram was rejected before reaching an assembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFault {
    /// Datagram shorter than the checksum trailer.
    Undersized { len: usize },
    /// Trailer does not match the CRC32 of the chunk bytes.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for IntegrityFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFault::Undersized { len } => {
                write!(f, "datagram of {} bytes is shorter than the checksum trailer", len)
            }
            IntegrityFault::ChecksumMismatch { expected, actual } => {
                write!(f, "CRC32 mismatch: trailer 0x{:08X}, computed 0x{:08X}", expected, actual)
            }
        }
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection state error: {0}")]
    ConnectionState(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("integrity error: {0}")]
    Integrity(IntegrityFault),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    Oversize { len: usize, max: usize },

    #[error("message sequence error: {0}")]
    Sequence(String),

    #[error("resource unavailable: {0}")]
    Unavailable(String),

    #[error("operation '{operation}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::ConnectionState(_) => ErrorKind::ConnectionState,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Oversize { .. } => ErrorKind::Oversize,
            Error::Sequence(_) => ErrorKind::Sequence,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
        }
    }

    /// Whether a supervised operation failing with this error should be retried.
    ///
    /// Configuration and state violations are caller bugs; retrying them only
    /// burns the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Integrity | ErrorKind::Decode | ErrorKind::Unavailable
        )
    }

    /// Whether this is a receive timeout rather than a socket failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Transport(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    pub(crate) fn not_connected(what: &str) -> Self {
        Error::ConnectionState(format!("{} is not connected", what))
    }
}

impl From<IntegrityFault> for Error {
    fn from(fault: IntegrityFault) -> Self {
        Error::Integrity(fault)
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Error::Decode(format!("encode: {}", e))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
