//! External-command provider
//!
//! Hands a whole-product download to a separate binary (`wget` by default),
//! invoked as `<command...> -O <local> <url>`. The byte count is the size of
//! the file the command left behind.
//!
//! Offsets are ignored: this provider only serves non-partitioned products
//! and reports `supports_offsets() == false` so blocks are never routed here.

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use super::error::{TransferError, TransferResult};
use super::{TransferProvider, TransferRequest};

pub const DEFAULT_COMMAND: &str = "/usr/bin/wget";

#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    schemes: Vec<String>,
}

impl CommandProvider {
    /// `command` is split on whitespace into the program and leading arguments
    pub fn new(command: &str, schemes: Vec<String>) -> TransferResult<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| TransferError::InvalidCommand(command.to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
            schemes,
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl TransferProvider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    fn schemes(&self) -> Vec<String> {
        self.schemes.clone()
    }

    fn supports_offsets(&self) -> bool {
        false
    }

    async fn get(&self, request: &TransferRequest<'_>) -> TransferResult<u64> {
        if request.is_partial() {
            return Err(TransferError::OffsetsUnsupported {
                provider: self.name().to_string(),
                path: request.message.rel_path.clone(),
                block: request.message.blocks.as_ref().map_or(0, |b| b.number),
            });
        }

        debug!(
            command = %self.command_line(),
            url = request.remote,
            local = %request.local.display(),
            "running transfer command"
        );

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("-O")
            .arg(request.local)
            .arg(request.remote)
            .output()
            .await
            .map_err(|e| TransferError::CommandFailed {
                command: self.command_line(),
                status: "spawn error".to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TransferError::CommandFailed {
                command: self.command_line(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let metadata = fs::metadata(request.local)
            .await
            .map_err(|e| TransferError::io(request.local, e))?;
        Ok(metadata.len())
    }
}
