//! `file` scheme provider
//!
//! Copies between local paths named by `file://` URLs. Honours offsets, so it
//! can move single blocks of partitioned products.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use super::error::{TransferError, TransferResult};
use super::{TransferProvider, TransferRequest};

/// Local filesystem provider
#[derive(Debug, Clone, Default)]
pub struct FileProvider;

impl FileProvider {
    pub fn new() -> Self {
        Self
    }
}

/// Path named by a `file://` URL
pub fn file_url_path(url: &str) -> TransferResult<PathBuf> {
    let parsed = Url::parse(url).map_err(|e| TransferError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    parsed.to_file_path().map_err(|_| TransferError::InvalidUrl {
        url: url.to_string(),
        reason: "not a local file URL".to_string(),
    })
}

/// Open `path` for writing at `offset`, truncating for whole-file writes
pub(crate) async fn open_for_write(
    path: &Path,
    offset: u64,
    truncate: bool,
) -> TransferResult<fs::File> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::io(path, e))?;
    }
    Ok(file)
}

async fn open_for_read(path: &Path, offset: u64) -> TransferResult<fs::File> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::io(path, e))?;
    }
    Ok(file)
}

async fn copy_range<R, W>(
    reader: R,
    writer: &mut W,
    length: Option<u64>,
    path: &Path,
) -> TransferResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match length {
        Some(length) => tokio::io::copy(&mut reader.take(length), writer).await,
        None => {
            let mut reader = reader;
            tokio::io::copy(&mut reader, writer).await
        }
    }
    .map_err(|e| TransferError::io(path, e))?;

    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(copied)
}

#[async_trait]
impl TransferProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn schemes(&self) -> Vec<String> {
        vec!["file".to_string()]
    }

    async fn get(&self, request: &TransferRequest<'_>) -> TransferResult<u64> {
        let source = file_url_path(request.remote)?;
        let input = open_for_read(&source, request.remote_offset).await?;
        let mut output =
            open_for_write(request.local, request.local_offset, !request.is_partial()).await?;
        copy_range(input, &mut output, request.length, request.local).await
    }

    async fn put(&self, request: &TransferRequest<'_>) -> TransferResult<u64> {
        let target = file_url_path(request.remote)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        let input = open_for_read(request.local, request.local_offset).await?;
        let mut output =
            open_for_write(&target, request.remote_offset, !request.is_partial()).await?;
        copy_range(input, &mut output, request.length, &target).await
    }
}
