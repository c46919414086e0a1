//! Scheme-routed transfer providers
//!
//! A [`TransferProvider`] moves the bytes a message describes. Providers are
//! registered per URL scheme in a [`ProviderRegistry`]; the flow resolves a
//! message's scheme (possibly rewritten by the [`AccelPolicy`]) to a provider
//! at transfer time.
//!
//! # Contract
//!
//! `get`/`put` receive the message, the remote URL, the local path (usually
//! an in-flight staging name, not the final one), the remote and local byte
//! offsets and the requested length. They return the number of bytes moved.
//! The caller treats any count other than the requested length as a failed
//! transfer. Providers that cannot honour offsets say so through
//! [`TransferProvider::supports_offsets`] and are never handed a block of a
//! partitioned product.

pub mod accel;
pub mod command;
pub mod error;
pub mod file;
pub mod http;
pub mod registry;

use std::path::Path;

use async_trait::async_trait;

use crate::message::Message;

pub use accel::AccelPolicy;
pub use command::CommandProvider;
pub use error::{TransferError, TransferResult};
pub use file::FileProvider;
pub use http::HttpProvider;
pub use registry::ProviderRegistry;

/// Which way data moves for a flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Fetch products to the local destination (`do_get`)
    #[default]
    Download,
    /// Deliver local products to a remote destination (`do_put`)
    Send,
    /// Messages only, no data movement
    None,
}

/// One transfer operation
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    pub message: &'a Message,
    /// Full remote URL
    pub remote: &'a str,
    /// Local file to write (get) or read (put)
    pub local: &'a Path,
    pub remote_offset: u64,
    pub local_offset: u64,
    /// Bytes requested; `None` when the product size is not declared
    pub length: Option<u64>,
}

impl<'a> TransferRequest<'a> {
    /// Whole-product request
    pub fn whole(message: &'a Message, remote: &'a str, local: &'a Path) -> Self {
        Self {
            message,
            remote,
            local,
            remote_offset: 0,
            local_offset: 0,
            length: message.size,
        }
    }

    /// Whether this request moves one block of a partitioned product
    pub fn is_partial(&self) -> bool {
        self.message.blocks.is_some()
    }

    /// Check the byte count a provider returned against the request
    pub fn verify(&self, transferred: u64) -> TransferResult<u64> {
        match self.length {
            Some(expected) if expected != transferred => Err(TransferError::ShortTransfer {
                path: self.message.rel_path.clone(),
                expected,
                actual: transferred,
            }),
            _ => Ok(transferred),
        }
    }
}

/// A capability object that moves data for one or more schemes
#[async_trait]
pub trait TransferProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Schemes this provider serves unless registered otherwise
    fn schemes(&self) -> Vec<String>;

    /// Whether `remote_offset`/`local_offset` are honoured
    fn supports_offsets(&self) -> bool {
        true
    }

    /// Fetch `request.remote` into `request.local`
    async fn get(&self, request: &TransferRequest<'_>) -> TransferResult<u64>;

    /// Deliver `request.local` to `request.remote`
    async fn put(&self, _request: &TransferRequest<'_>) -> TransferResult<u64> {
        Err(TransferError::Unsupported {
            provider: self.name().to_string(),
            operation: "put".to_string(),
        })
    }

    /// Periodic maintenance (connection pruning, cache eviction)
    async fn housekeeping(&self) -> TransferResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_verify_byte_count() {
        let message = Message::new("http://h", "a").with_size(10);
        let local = PathBuf::from("/tmp/a");
        let request = TransferRequest::whole(&message, "http://h/a", &local);

        assert_eq!(request.verify(10).unwrap(), 10);
        assert!(matches!(
            request.verify(4),
            Err(TransferError::ShortTransfer {
                expected: 10,
                actual: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_undeclared_size_accepts_any_count() {
        let message = Message::new("http://h", "a");
        let local = PathBuf::from("/tmp/a");
        let request = TransferRequest::whole(&message, "http://h/a", &local);
        assert_eq!(request.verify(1234).unwrap(), 1234);
    }
}
