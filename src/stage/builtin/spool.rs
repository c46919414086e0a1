//! `post.spool`: publish `ok` messages as JSON files in a directory
//!
//! Files are written under a temporary name and renamed into place, so a
//! spool reader (another flow's spool source, for instance) never sees a
//! partial message. Names sort in posting order.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::debug;

use crate::stage::options::{OptionKind, OptionSchema, StageOptions};
use crate::stage::registry::StageDescriptor;
use crate::stage::{EntryPoints, Stage, StageResult};
use crate::worklist::Worklist;

pub const NAME: &str = "post.spool";

pub(super) fn descriptor() -> StageDescriptor {
    StageDescriptor::new(
        NAME,
        "write each ok message, stripped of transient fields, to post_dir",
        EntryPoints::ON_START | EntryPoints::POST,
        OptionSchema::new().required("post_dir", OptionKind::Str, "directory to publish into"),
        |options| Ok(Box::new(SpoolPoster::from_options(&options)?) as Box<dyn Stage>),
    )
}

pub struct SpoolPoster {
    post_dir: PathBuf,
    sequence: u64,
}

impl SpoolPoster {
    pub fn new(post_dir: impl Into<PathBuf>) -> Self {
        Self {
            post_dir: post_dir.into(),
            sequence: 0,
        }
    }

    pub fn from_options(options: &StageOptions) -> StageResult<Self> {
        Ok(Self::new(options.string("post_dir")?))
    }

    fn next_name(&mut self) -> String {
        self.sequence += 1;
        format!(
            "{}_{:08}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.9f"),
            self.sequence
        )
    }
}

#[async_trait]
impl Stage for SpoolPoster {
    fn name(&self) -> &str {
        NAME
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_START | EntryPoints::POST
    }

    async fn on_start(&mut self) -> StageResult<()> {
        fs::create_dir_all(&self.post_dir)
            .await
            .with_context(|| format!("creating {}", self.post_dir.display()))
    }

    async fn post(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        for message in &worklist.ok {
            let mut outgoing = message.clone();
            outgoing.strip_for_post()?;
            let body = serde_json::to_vec(&outgoing.to_value()?)?;

            let name = self.next_name();
            let staging = self.post_dir.join(format!(".{}.tmp", name));
            let target = self.post_dir.join(&name);
            fs::write(&staging, &body)
                .await
                .with_context(|| format!("writing {}", staging.display()))?;
            fs::rename(&staging, &target)
                .await
                .with_context(|| format!("publishing {}", target.display()))?;

            debug!(message = %message.describe(), file = %name, "posted to spool");
        }
        Ok(())
    }
}
