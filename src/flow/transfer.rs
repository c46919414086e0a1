//! The transfer step of a cycle
//!
//! Every `ok` message is moved by the provider its (possibly accelerated)
//! scheme resolves to. Whole products are written under the inflight name
//! and renamed when complete; blocks of partitioned products are written in
//! place at their offset.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};

use super::report::{Report, ReportEntry, CODE_DOWNLOADED, CODE_SENT, CODE_TRANSFER_FAILED};
use super::{guarded, Flow};
use crate::message::{join_url, Blocks, Message};
use crate::stage::{EntryPoint, EntryPoints};
use crate::transfer::file::file_url_path;
use crate::transfer::{Direction, TransferError, TransferProvider, TransferRequest, TransferResult};
use crate::worklist::Worklist;

impl Flow {
    /// Move the data of every `ok` message; failures are demoted to `failed`
    pub(super) async fn transfer(&mut self, worklist: &mut Worklist, reports: &mut Vec<ReportEntry>) {
        if self.settings.direction == Direction::None {
            return;
        }

        let candidates = std::mem::take(&mut worklist.ok);
        for mut message in candidates {
            let outcome = match self.settings.direction {
                Direction::Download => self.download(&mut message).await,
                Direction::Send => self.send(&mut message).await,
                Direction::None => Ok(None),
            };

            match outcome {
                Ok(Some(bytes)) => {
                    self.stats.transfers += 1;
                    self.stats.bytes += bytes;
                    if self.settings.report_back {
                        let report = match self.settings.direction {
                            Direction::Send => Report::new(CODE_SENT, "Sent"),
                            _ => Report::new(CODE_DOWNLOADED, "Downloaded"),
                        };
                        reports.push(ReportEntry::attach(&mut message, report));
                    }
                    worklist.ok.push(message);
                }
                Ok(None) => worklist.ok.push(message),
                Err(e) => {
                    self.stats.transfer_failures += 1;
                    warn!(
                        flow = %self.settings.name,
                        message = %message.describe(),
                        scheme = message.scheme().unwrap_or(""),
                        retriable = e.is_retriable(),
                        error = %e,
                        "transfer failed"
                    );
                    if self.settings.report_back {
                        let report = Report::new(CODE_TRANSFER_FAILED, e.to_string());
                        reports.push(ReportEntry::attach(&mut message, report));
                    }
                    worklist.failed.push(message);
                }
            }
        }
    }

    /// Fetch one product. `None` when there was nothing to move.
    async fn download(&mut self, message: &mut Message) -> TransferResult<Option<u64>> {
        let target = self.destination(message)?;

        if message.is_removal() {
            match fs::remove_file(&target).await {
                Ok(()) => debug!(flow = %self.settings.name, file = %target.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TransferError::io(&target, e)),
            }
            return Ok(None);
        }
        if message.is_link() {
            return Ok(None);
        }

        let scheme = message
            .scheme()
            .map(str::to_string)
            .ok_or_else(|| TransferError::InvalidUrl {
                url: message.base_url.clone(),
                reason: "no scheme".to_string(),
            })?;
        let (dispatch, provider) = self.provider_for(message, &scheme)?;

        if let Some(blocks) = &message.blocks {
            if !provider.supports_offsets() {
                return Err(TransferError::OffsetsUnsupported {
                    provider: provider.name().to_string(),
                    path: message.rel_path.clone(),
                    block: blocks.number,
                });
            }
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }

        let remote = message.retrieval_url();
        debug!(
            flow = %self.settings.name,
            message = %message.describe(),
            scheme = %dispatch,
            provider = provider.name(),
            "downloading"
        );

        let moved = match message.blocks.clone() {
            Some(blocks) => {
                let request = block_request(message, &remote, &target, &blocks);
                let moved = request.verify(provider.get(&request).await?)?;
                self.notify_part(message, &blocks).await;
                moved
            }
            None => {
                let staging = inflight_path(&target, &self.settings.inflight);
                let request = TransferRequest::whole(message, &remote, &staging);
                let moved = match provider.get(&request).await.and_then(|n| request.verify(n)) {
                    Ok(moved) => moved,
                    Err(e) => {
                        discard(&staging).await;
                        return Err(e);
                    }
                };
                self.transform_data(&staging).await?;
                if staging != target {
                    fs::rename(&staging, &target)
                        .await
                        .map_err(|e| TransferError::io(&target, e))?;
                }
                moved
            }
        };
        Ok(Some(moved))
    }

    /// Deliver one local product to the flow's destination
    async fn send(&mut self, message: &mut Message) -> TransferResult<Option<u64>> {
        let Some(destination) = self.settings.destination.clone() else {
            return Err(TransferError::NoDestination {
                path: message.rel_path.clone(),
            });
        };
        if message.is_removal() || message.is_link() {
            return Ok(None);
        }

        let local = match message.local_path() {
            Some(path) => path,
            None => file_url_path(&message.retrieval_url())?,
        };
        let scheme = destination
            .split_once("://")
            .map(|(scheme, _)| scheme.to_string())
            .ok_or_else(|| TransferError::InvalidUrl {
                url: destination.clone(),
                reason: "no scheme".to_string(),
            })?;
        let (dispatch, provider) = self.provider_for(message, &scheme)?;
        let remote = join_url(&destination, &message.rel_path);

        debug!(
            flow = %self.settings.name,
            message = %message.describe(),
            scheme = %dispatch,
            provider = provider.name(),
            "sending"
        );

        let moved = match message.blocks.clone() {
            Some(blocks) => {
                if !provider.supports_offsets() {
                    return Err(TransferError::OffsetsUnsupported {
                        provider: provider.name().to_string(),
                        path: message.rel_path.clone(),
                        block: blocks.number,
                    });
                }
                let request = block_request(message, &remote, &local, &blocks);
                let moved = request.verify(provider.put(&request).await?)?;
                self.notify_part(message, &blocks).await;
                moved
            }
            None => {
                let request = TransferRequest::whole(message, &remote, &local);
                request.verify(provider.put(&request).await?)?
            }
        };
        Ok(Some(moved))
    }

    /// Scheme and provider that will move `message`. A block is never handed
    /// to an accelerated provider that cannot write at an offset; it stays on
    /// the provider of its own scheme.
    fn provider_for(
        &self,
        message: &Message,
        scheme: &str,
    ) -> TransferResult<(String, Arc<dyn TransferProvider>)> {
        let dispatch = self.accel.dispatch_scheme(message, scheme);
        let provider = self.providers.resolve(dispatch)?;
        if message.blocks.is_none() || dispatch == scheme || provider.supports_offsets() {
            return Ok((dispatch.to_string(), provider));
        }

        debug!(
            flow = %self.settings.name,
            message = %message.describe(),
            accelerated = dispatch,
            provider = provider.name(),
            scheme,
            "accelerated provider cannot write blocks, keeping the plain scheme"
        );
        Ok((scheme.to_string(), self.providers.resolve(scheme)?))
    }

    /// Where a download lands: `new_dir/new_file`, or the flow directory
    /// mirroring `relPath`. Fills in `new_dir`/`new_file` in the latter case.
    fn destination(&self, message: &mut Message) -> TransferResult<PathBuf> {
        if let Some(path) = message.local_path() {
            return Ok(path);
        }
        let no_destination = || TransferError::NoDestination {
            path: message.rel_path.clone(),
        };

        let Some(root) = &self.settings.directory else {
            return Err(no_destination());
        };
        let relative = Path::new(message.rel_path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(no_destination());
        }
        let Some(file) = relative.file_name().map(|f| f.to_string_lossy().into_owned()) else {
            return Err(no_destination());
        };
        let dir = match relative.parent() {
            Some(parent) => root.join(parent),
            None => root.clone(),
        };

        message.new_dir = Some(dir.to_string_lossy().into_owned());
        message.new_file = Some(file.clone());
        Ok(dir.join(file))
    }

    /// Run a downloaded file through the `on_data` chain
    async fn transform_data(&mut self, path: &Path) -> TransferResult<()> {
        if !self.chain.any(EntryPoints::ON_DATA) {
            return Ok(());
        }
        let data = fs::read(path).await.map_err(|e| TransferError::io(path, e))?;
        let transformed = self.chain.apply_data(Bytes::from(data));
        fs::write(path, &transformed)
            .await
            .map_err(|e| TransferError::io(path, e))
    }

    async fn notify_part(&mut self, message: &Message, blocks: &Blocks) {
        for index in self.chain.indices(EntryPoints::ON_PART) {
            let Some(loaded) = self.chain.get_mut(index) else {
                continue;
            };
            let name = loaded.name().to_string();
            if let Err(e) = guarded(loaded.stage.on_part(message, blocks)).await {
                self.stats.stage_faults += 1;
                warn!(
                    flow = %self.settings.name,
                    stage = %name,
                    entry_point = %EntryPoint::OnPart,
                    message = %message.describe(),
                    error = format!("{:#}", e),
                    "stage fault"
                );
            }
        }
    }
}

fn block_request<'a>(
    message: &'a Message,
    remote: &'a str,
    local: &'a Path,
    blocks: &Blocks,
) -> TransferRequest<'a> {
    TransferRequest {
        message,
        remote,
        local,
        remote_offset: blocks.offset(),
        local_offset: blocks.offset(),
        length: Some(blocks.length()),
    }
}

fn inflight_path(target: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        return target.to_path_buf();
    }
    let mut name = target.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

async fn discard(staging: &Path) {
    if let Err(e) = fs::remove_file(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %staging.display(), error = %e, "could not remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_path() {
        let target = Path::new("/data/obs/a.xml");
        assert_eq!(inflight_path(target, ".tmp"), PathBuf::from("/data/obs/a.xml.tmp"));
        assert_eq!(inflight_path(target, ""), target.to_path_buf());
    }

    #[test]
    fn test_block_request_offsets() {
        let blocks = Blocks {
            method: "inplace".to_string(),
            size: 100,
            count: 3,
            remainder: 40,
            number: 2,
        };
        let message = Message::new("file://", "/a").with_blocks(blocks.clone());
        let local = PathBuf::from("/tmp/a");
        let request = block_request(&message, "file:///a", &local, &blocks);

        assert_eq!(request.remote_offset, 200);
        assert_eq!(request.local_offset, 200);
        assert_eq!(request.length, Some(40));
        assert!(request.is_partial());
    }
}
