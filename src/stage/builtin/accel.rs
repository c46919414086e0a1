//! `accel.command`: serve accelerated schemes with an external downloader
//!
//! Loaded together with a flow `accel.threshold`, large products are
//! dispatched on `download`/`downloads` and end up here.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::stage::options::{OptionKind, OptionSchema, OptionValue, StageOptions};
use crate::stage::registry::StageDescriptor;
use crate::stage::{EntryPoints, Stage, StageResult};
use crate::transfer::command::{CommandProvider, DEFAULT_COMMAND};
use crate::transfer::TransferProvider;

pub const NAME: &str = "accel.command";

pub(super) fn descriptor() -> StageDescriptor {
    StageDescriptor::new(
        NAME,
        "download accelerated schemes with an external command (no partitioned products)",
        EntryPoints::ON_START | EntryPoints::DO_GET,
        OptionSchema::new()
            .option(
                "accel_command",
                OptionKind::Str,
                OptionValue::Str(DEFAULT_COMMAND.to_string()),
                "downloader, invoked as <command> -O <local> <url>",
            )
            .option(
                "accel_schemes",
                OptionKind::List,
                OptionValue::List(vec!["download".to_string(), "downloads".to_string()]),
                "schemes this stage serves",
            ),
        |options| Ok(Box::new(AccelCommand::from_options(&options)?) as Box<dyn Stage>),
    )
}

pub struct AccelCommand {
    provider: Arc<CommandProvider>,
}

impl AccelCommand {
    pub fn from_options(options: &StageOptions) -> StageResult<Self> {
        let schemes = options.list("accel_schemes")?.to_vec();
        if schemes.is_empty() {
            anyhow::bail!("accel_schemes is empty");
        }
        let provider = CommandProvider::new(options.string("accel_command")?, schemes)?;
        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

#[async_trait]
impl Stage for AccelCommand {
    fn name(&self) -> &str {
        NAME
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_START | EntryPoints::DO_GET
    }

    async fn on_start(&mut self) -> StageResult<()> {
        info!(
            stage = NAME,
            command = %self.provider.command_line(),
            schemes = ?self.provider.schemes(),
            "accelerated downloads enabled"
        );
        Ok(())
    }

    fn transfer_provider(&self) -> Option<Arc<dyn TransferProvider>> {
        Some(self.provider.clone())
    }
}
