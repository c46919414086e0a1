//! Transfer fault taxonomy
//!
//! Every variant ends the same way for the message concerned (demoted to
//! `failed`, optionally reported); the variants exist so logs and reports say
//! what actually went wrong.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type TransferResult<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Nothing is registered for the scheme
    #[error("no transfer provider registered for scheme '{scheme}'")]
    NoProvider { scheme: String },

    /// The provider does not implement the operation
    #[error("provider '{provider}' does not support {operation}")]
    Unsupported { provider: String, operation: String },

    /// A partitioned transfer was routed to a provider that ignores offsets
    #[error("provider '{provider}' ignores offsets and cannot move block {block} of {path}")]
    OffsetsUnsupported {
        provider: String,
        path: String,
        block: u64,
    },

    /// Fewer (or more) bytes moved than requested
    #[error("transferred {actual} bytes of {expected} for {path}")]
    ShortTransfer {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Remote answered with a failure status
    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    /// External transfer command exited non-zero
    #[error("command '{command}' failed with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid transfer command '{0}'")]
    InvalidCommand(String),

    #[error("invalid transfer URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("message has no destination (new_dir/new_file) for {path}")]
    NoDestination { path: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("network error: {0}")]
    Network(String),
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if retrying the same transfer later may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            TransferError::Network(_) | TransferError::ShortTransfer { .. } => true,
            TransferError::Status { status, .. } => *status >= 500 || *status == 404,
            TransferError::CommandFailed { .. } => true,
            TransferError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotFound
            ),
            TransferError::NoProvider { .. }
            | TransferError::Unsupported { .. }
            | TransferError::OffsetsUnsupported { .. }
            | TransferError::InvalidCommand(_)
            | TransferError::InvalidUrl { .. }
            | TransferError::NoDestination { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(TransferError::Network("reset".into()).is_retriable());
        assert!(TransferError::Status {
            url: "http://h/a".into(),
            status: 503
        }
        .is_retriable());
        assert!(!TransferError::Status {
            url: "http://h/a".into(),
            status: 403
        }
        .is_retriable());
        assert!(!TransferError::NoProvider {
            scheme: "gopher".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_short_transfer_display() {
        let err = TransferError::ShortTransfer {
            path: "obs/a.xml".into(),
            expected: 100,
            actual: 40,
        };
        assert_eq!(err.to_string(), "transferred 40 bytes of 100 for obs/a.xml");
    }
}
