//! Error types for trellis operations
//!
//! All engine errors are represented by the TrellisError enum, which carries
//! enough context (paths, offsets, limits) to diagnose a failure without a
//! debugger. An absent key is not an error: lookups return `Option`.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Trellis error types with detailed context
#[derive(Debug, Clone)]
pub enum TrellisError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// On-disk state is inconsistent and cannot be trusted
    Corruption {
        /// File in which the inconsistency was detected, if known
        path: Option<PathBuf>,
        /// Description of what failed validation
        detail: String,
    },

    /// A fixed engine limit was hit
    ResourceExhausted {
        /// Which resource ran out (e.g. "region count", "reference count")
        resource: &'static str,
        /// The limit that was reached
        limit: u64,
    },

    /// The id-directory is flagged as mid-collection and recovery was not requested
    GcInProgress {
        /// The database directory
        path: PathBuf,
    },

    /// The caller passed something the engine cannot act on
    InvalidArgument {
        /// Description of the rejected argument
        what: String,
    },

    /// A try-lock variant found the object locked by another thread
    WouldBlock,
}

impl fmt::Display for TrellisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrellisError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            TrellisError::Corruption { path, detail } => {
                if let Some(path) = path {
                    write!(f, "corruption in {}: {}", path.display(), detail)
                } else {
                    write!(f, "corruption: {}", detail)
                }
            }

            TrellisError::ResourceExhausted { resource, limit } => {
                write!(f, "resource exhausted: {} reached limit {}", resource, limit)
            }

            TrellisError::GcInProgress { path } => {
                write!(
                    f,
                    "garbage collection in progress in {}; reopen with recovery",
                    path.display()
                )
            }

            TrellisError::InvalidArgument { what } => {
                write!(f, "invalid argument: {}", what)
            }

            TrellisError::WouldBlock => write!(f, "object is locked by another thread"),
        }
    }
}

impl Error for TrellisError {}

/// Convert std::io::Error to TrellisError::Io
impl From<std::io::Error> for TrellisError {
    fn from(err: std::io::Error) -> Self {
        TrellisError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for trellis operations
pub type TrellisResult<T> = Result<T, TrellisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrellisError::Corruption {
            path: Some(PathBuf::from("/tmp/trellis.ids")),
            detail: "slot count disagrees with file size".to_string(),
        };

        let display = format!("{}", err);
        assert!(display.contains("corruption"));
        assert!(display.contains("trellis.ids"));
        assert!(display.contains("slot count"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TrellisError = io_err.into();

        match err {
            TrellisError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_resource_exhausted_display() {
        let err = TrellisError::ResourceExhausted { resource: "reference count", limit: 8190 };
        let display = format!("{}", err);
        assert!(display.contains("reference count"));
        assert!(display.contains("8190"));
    }
}
