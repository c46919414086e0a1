//! Spool-directory source
//!
//! Each `*.json` file in the directory is one message. Files are delivered in
//! name order; acknowledging a message deletes its file. A file that was
//! delivered but never acknowledged is still there after a restart and is
//! delivered again. Files that do not decode are renamed to `*.bad`.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use super::{MessageSource, SourceError, SourceResult};
use crate::message::Message;

const SPOOL_FILE: &str = "spool_file";

#[derive(Debug)]
pub struct SpoolSource {
    dir: PathBuf,
    in_flight: HashSet<PathBuf>,
}

impl SpoolSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            in_flight: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn list(&self) -> SourceResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::Unavailable {
                    source_name: self.name().to_string(),
                    reason: format!("{} does not exist", self.dir.display()),
                })
            }
            Err(e) => return Err(SourceError::io(&self.dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SourceError::io(&self.dir, e))?
        {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            if !self.in_flight.contains(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn quarantine(&self, path: &Path, reason: &str) {
        warn!(file = %path.display(), reason, "undecodable spool file set aside");
        let bad = path.with_extension("bad");
        if let Err(e) = fs::rename(path, &bad).await {
            warn!(file = %path.display(), error = %e, "could not set spool file aside");
        }
    }
}

#[async_trait]
impl MessageSource for SpoolSource {
    fn name(&self) -> &str {
        "spool"
    }

    async fn fetch_batch(&mut self, max: usize) -> SourceResult<Vec<Message>> {
        let mut batch = Vec::new();
        for path in self.list().await? {
            if batch.len() >= max {
                break;
            }

            let body = match fs::read(&path).await {
                Ok(body) => body,
                // acknowledged by a concurrent reader
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SourceError::io(&path, e)),
            };
            let decoded = serde_json::from_slice(&body)
                .map_err(|e| e.to_string())
                .and_then(|value| Message::from_value(value).map_err(|e| e.to_string()));

            match decoded {
                Ok(mut message) => {
                    message.set(SPOOL_FILE, path.display().to_string());
                    message.add_delete_on_post(SPOOL_FILE);
                    self.in_flight.insert(path);
                    batch.push(message);
                }
                Err(reason) => self.quarantine(&path, &reason).await,
            }
        }
        Ok(batch)
    }

    async fn acknowledge(&mut self, message: &Message) -> SourceResult<()> {
        let path = message
            .get(SPOOL_FILE)
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| SourceError::UnknownDelivery {
                rel_path: message.rel_path.clone(),
                reason: "no spool_file".to_string(),
            })?;

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SourceError::io(&path, e)),
        }
        self.in_flight.remove(&path);
        Ok(())
    }

    async fn close(&mut self) -> SourceResult<()> {
        self.in_flight.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn spool(dir: &Path, name: &str, rel_path: &str) {
        let body = json!({
            "pubTime": "20240101T000000",
            "baseUrl": "file:///",
            "relPath": rel_path,
        });
        std::fs::write(dir.join(name), body.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_name_order_and_batch_limit() {
        let dir = tempdir().unwrap();
        spool(dir.path(), "002.json", "b");
        spool(dir.path(), "001.json", "a");
        spool(dir.path(), "003.json", "c");
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = SpoolSource::new(dir.path());
        let batch = source.fetch_batch(2).await.unwrap();
        let paths: Vec<_> = batch.iter().map(|m| m.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b"]);

        // in-flight files are not delivered twice
        let rest = source.fetch_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].rel_path, "c");
    }

    #[tokio::test]
    async fn test_ack_removes_file() {
        let dir = tempdir().unwrap();
        spool(dir.path(), "001.json", "a");

        let mut source = SpoolSource::new(dir.path());
        let batch = source.fetch_batch(10).await.unwrap();
        source.acknowledge(&batch[0]).await.unwrap();
        assert!(!dir.path().join("001.json").exists());

        // acknowledging again is harmless
        source.acknowledge(&batch[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unacked_redelivered_after_close() {
        let dir = tempdir().unwrap();
        spool(dir.path(), "001.json", "a");

        let mut source = SpoolSource::new(dir.path());
        assert_eq!(source.fetch_batch(10).await.unwrap().len(), 1);
        assert!(source.fetch_batch(10).await.unwrap().is_empty());

        source.close().await.unwrap();
        assert_eq!(source.fetch_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_file_set_aside() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("001.json"), "{not json").unwrap();
        spool(dir.path(), "002.json", "b");

        let mut source = SpoolSource::new(dir.path());
        let batch = source.fetch_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(dir.path().join("001.bad").exists());
    }

    #[tokio::test]
    async fn test_missing_dir_is_transient() {
        let dir = tempdir().unwrap();
        let mut source = SpoolSource::new(dir.path().join("absent"));
        let err = source.fetch_batch(1).await.unwrap_err();
        assert!(err.is_transient());
    }
}
