//! `http`/`https` provider
//!
//! Blocks of partitioned products are fetched with `Range` requests and
//! written at their local offset.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::{TransferError, TransferResult};
use super::file::open_for_write;
use super::{TransferProvider, TransferRequest};

/// HTTP(S) download provider
#[derive(Debug, Clone, Default)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Use a preconfigured client (timeouts, proxies, TLS roots)
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn range_header(request: &TransferRequest<'_>) -> Option<String> {
    if request.remote_offset == 0 && !request.is_partial() {
        return None;
    }
    let start = request.remote_offset;
    Some(match request.length {
        Some(length) if length > 0 => format!("bytes={}-{}", start, start + length - 1),
        _ => format!("bytes={}-", start),
    })
}

#[async_trait]
impl TransferProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn schemes(&self) -> Vec<String> {
        vec!["http".to_string(), "https".to_string()]
    }

    async fn get(&self, request: &TransferRequest<'_>) -> TransferResult<u64> {
        let mut builder = self.client.get(request.remote);
        let range = range_header(request);
        if let Some(range) = &range {
            builder = builder.header(RANGE, range);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransferError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                url: request.remote.to_string(),
                status: status.as_u16(),
            });
        }
        if range.is_some() && request.remote_offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::Network(format!(
                "{} ignored the range request",
                request.remote
            )));
        }

        let mut file =
            open_for_write(request.local, request.local_offset, !request.is_partial()).await?;
        let mut transferred = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::Network(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(request.local, e))?;
            transferred += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| TransferError::io(request.local, e))?;

        debug!(
            url = request.remote,
            bytes = transferred,
            status = status.as_u16(),
            "http get complete"
        );
        Ok(transferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Blocks, Message};
    use std::path::PathBuf;

    #[test]
    fn test_range_header() {
        let local = PathBuf::from("/tmp/x");
        let whole = Message::new("http://h", "a").with_size(10);
        let request = TransferRequest::whole(&whole, "http://h/a", &local);
        assert_eq!(range_header(&request), None);

        let blocks = Blocks {
            method: "inplace".into(),
            size: 100,
            count: 3,
            remainder: 50,
            number: 2,
        };
        let block = Message::new("http://h", "a").with_blocks(blocks.clone());
        let request = TransferRequest {
            message: &block,
            remote: "http://h/a",
            local: &local,
            remote_offset: blocks.offset(),
            local_offset: blocks.offset(),
            length: Some(blocks.length()),
        };
        assert_eq!(range_header(&request).as_deref(), Some("bytes=200-249"));
    }
}
