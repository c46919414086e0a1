//! Message sources
//!
//! A [`MessageSource`] is the flow's upstream: batches are pulled, each
//! message is acknowledged exactly once, and anything fetched but never
//! acknowledged is the source's to deliver again (after a reconnect or a
//! restart).

pub mod memory;
pub mod spool;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

pub use memory::{MemoryBroker, MemorySource};
pub use spool::SpoolSource;

#[derive(Debug, Error)]
pub enum SourceError {
    /// Source unreachable; the engine backs off and tries again
    #[error("source '{source_name}' unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The message carries no delivery handle this source knows about
    #[error("cannot acknowledge {rel_path}: {reason}")]
    UnknownDelivery { rel_path: String, reason: String },

    /// Shared state was poisoned by a panicking holder
    #[error("source state poisoned: {0}")]
    Poisoned(String),
}

impl SourceError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SourceError::Io {
            path: path.into(),
            source,
        }
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Unavailable { .. } | SourceError::Io { .. } => true,
            SourceError::UnknownDelivery { .. } | SourceError::Poisoned(_) => false,
        }
    }
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Upstream of a flow
#[async_trait]
pub trait MessageSource: Send {
    fn name(&self) -> &str;

    /// Up to `max` messages, in delivery order. An empty batch is normal.
    async fn fetch_batch(&mut self, max: usize) -> SourceResult<Vec<Message>>;

    /// Confirm `message` is handled; the source may forget it
    async fn acknowledge(&mut self, message: &Message) -> SourceResult<()>;

    /// Release the connection; unacknowledged messages become deliverable again
    async fn close(&mut self) -> SourceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SourceError::Unavailable {
            source_name: "memory".into(),
            reason: "down".into()
        }
        .is_transient());
        assert!(!SourceError::Poisoned("lock".into()).is_transient());
    }
}
