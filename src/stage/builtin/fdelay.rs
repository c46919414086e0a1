//! `msg.fdelay`: hold messages until they and their file are old enough
//!
//! Every message is at least `fdelay` old before it is forwarded. Younger
//! ones are marked failed with the retry flag cleared so the retry queue
//! offers them again later without counting an attempt. Removal notices
//! carry nothing to wait for and are rejected at once.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use crate::message::Message;
use crate::stage::options::{OptionKind, OptionSchema, OptionValue, StageOptions};
use crate::stage::registry::StageDescriptor;
use crate::stage::{EntryPoints, Stage, StageResult};
use crate::worklist::Worklist;

pub const NAME: &str = "msg.fdelay";
pub const DEFAULT_DELAY: Duration = Duration::from_secs(60);

pub(super) fn descriptor() -> StageDescriptor {
    StageDescriptor::new(
        NAME,
        "hold messages until they and their file are at least fdelay old",
        EntryPoints::ON_MESSAGES,
        OptionSchema::new()
            .option(
                "fdelay",
                OptionKind::Duration,
                OptionValue::Duration(DEFAULT_DELAY),
                "minimum age of message and file",
            )
            .optional("msg_fdelay", OptionKind::Duration, "alias of fdelay, wins when set"),
        |options| Ok(Box::new(FileDelay::from_options(&options)?) as Box<dyn Stage>),
    )
}

/// Why a message was held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    MessageTooYoung,
    FileMissing,
    FileTooYoung,
}

pub struct FileDelay {
    delay: Duration,
}

impl FileDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_options(options: &StageOptions) -> StageResult<Self> {
        let delay = if options.is_set("msg_fdelay") {
            options.duration("msg_fdelay")?
        } else {
            options.duration("fdelay")?
        };
        Ok(Self::new(delay))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// File the message refers to: the destination when known, else the
    /// relative path
    fn referenced_file(message: &Message) -> PathBuf {
        message
            .local_path()
            .unwrap_or_else(|| PathBuf::from(&message.rel_path))
    }

    async fn check(&self, message: &Message, age: Duration) -> Option<Hold> {
        if age < self.delay {
            return Some(Hold::MessageTooYoung);
        }

        let path = Self::referenced_file(message);
        let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return Some(Hold::FileMissing),
        };
        let file_age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        (file_age < self.delay).then_some(Hold::FileTooYoung)
    }
}

#[async_trait]
impl Stage for FileDelay {
    fn name(&self) -> &str {
        NAME
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_MESSAGES
    }

    async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        let now = Utc::now();
        let mut outgoing = Vec::with_capacity(worklist.incoming.len());

        for mut message in std::mem::take(&mut worklist.incoming) {
            if message.is_removal() {
                debug!(message = %message.describe(), "removal passes without delay");
                worklist.rejected.push(message);
                continue;
            }

            let published = match message.published_at() {
                Ok(published) => published,
                Err(e) => {
                    warn!(message = %message.describe(), error = %e, "rejected");
                    worklist.rejected.push(message);
                    continue;
                }
            };
            let age = now
                .signed_duration_since(published)
                .to_std()
                .unwrap_or(Duration::ZERO);

            match self.check(&message, age).await {
                None => outgoing.push(message),
                Some(hold) => {
                    debug!(
                        message = %message.describe(),
                        reason = ?hold,
                        wait_secs = self.delay.saturating_sub(age).as_secs_f64(),
                        "not old enough, deferred"
                    );
                    message.set_retry(false);
                    worklist.failed.push(message);
                }
            }
        }

        worklist.incoming = outgoing;
        Ok(())
    }
}
