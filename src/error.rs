//! Error kinds surfaced by every component of ziptag.

use std::{fmt, io, result};

/// Crate-wide result alias, mirroring the storage-engine convention of a
/// single `Result<T>` bound to a single `Error` enum.
pub type Result<T> = result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Syntax or unknown-function error while parsing a query. Carries the
    /// byte offset of the offending token and a short fix hint.
    QueryParseError {
        reason: String,
        position: usize,
        suggestion: String,
    },
    /// Unknown ttype referenced where a type is required, and
    /// `Config::strict_types` is set.
    QueryTypeError(String),
    /// Oversize value, bad ttype identifier, or a self-link attempt.
    ValidationError(String),
    /// `Tx::commit` observed a base that invalidates a staged
    /// removal/unlink.
    ConflictStaleParent,
    /// WAL record failed its CRC32C check at the given byte offset.
    DurabilityCorrupt(u64),
    /// I/O failure on the durability path that isn't a corruption.
    DurabilityIoFailed(String),
    /// Query execution was cancelled via its `Cancel` token.
    Cancelled,
    /// Explicit lookup miss for APIs that promise to surface it.
    NotFound(String),
    /// `Store::open` lost the data directory's exclusive flock to another
    /// open instance.
    Busy(String),
    /// Wraps any other I/O failure (file open, read, write, rename).
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QueryParseError {
                reason,
                position,
                suggestion,
            } => write!(
                f,
                "query parse error at {}: {} ({})",
                position, reason, suggestion
            ),
            Error::QueryTypeError(t) => write!(f, "unknown ttype: {}", t),
            Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
            Error::ConflictStaleParent => {
                write!(f, "commit conflict: parent revision is stale")
            }
            Error::DurabilityCorrupt(offset) => {
                write!(f, "wal corruption at offset {}", offset)
            }
            Error::DurabilityIoFailed(cause) => write!(f, "durability i/o failed: {}", cause),
            Error::Cancelled => write!(f, "query cancelled"),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::Busy(what) => write!(f, "store busy: {}", what),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}
