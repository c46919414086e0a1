//! Retry queue for failed messages
//!
//! Messages that end a cycle in `failed` are kept here and offered back to
//! `incoming` in later cycles, flagged `isRetry`, once their penalty delay has
//! elapsed. They were acknowledged in the cycle that failed them and are
//! never acknowledged again.
//!
//! Only failures of retry-flagged messages count as attempts. A stage that
//! clears the flag (the delay stage does) defers a message without bringing
//! it closer to exhaustion. With `max_attempts` set, a message whose counted
//! failures exceed it is exhausted and moved to `rejected`.
//!
//! The queue can be persisted as JSON Lines, one
//! `{"attempts": n, "message": {...}}` object per line, rewritten atomically.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use meridian_core_resilience::{PenaltyBox, PenaltyConfig, Verdict};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::{Message, Origin};

/// Retry policy for a flow
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// JSON Lines file the queue survives restarts in
    pub path: Option<PathBuf>,
    /// Counted failures tolerated; `None` retries forever
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let penalties = PenaltyConfig::default();
        Self {
            path: None,
            max_attempts: None,
            initial_delay: penalties.initial_delay,
            max_delay: penalties.max_delay,
            backoff_factor: penalties.backoff_factor,
        }
    }
}

impl RetryPolicy {
    fn penalty_config(&self) -> PenaltyConfig {
        PenaltyConfig {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            max_penalties: self.max_attempts,
        }
    }
}

/// What happened to a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Counted failure; eligible again after `after`
    Retry { after: Duration, attempts: u32 },
    /// Not attempted (retry flag clear); eligible again after `after`
    Deferred { after: Duration },
    /// Too many counted failures
    Exhausted { attempts: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    attempts: u32,
    message: Value,
}

#[derive(Debug)]
pub struct RetryQueue {
    policy: RetryPolicy,
    entries: VecDeque<Message>,
    penalties: PenaltyBox,
}

impl RetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        let penalties = PenaltyBox::new(policy.penalty_config());
        Self {
            policy,
            entries: VecDeque::new(),
            penalties,
        }
    }

    /// Create the queue, reloading persisted entries when a path is set
    pub async fn open(policy: RetryPolicy) -> Result<Self> {
        let mut queue = Self::new(policy);
        if let Some(path) = queue.policy.path.clone() {
            queue.load(&path).await?;
        }
        Ok(queue)
    }

    async fn load(&mut self, path: &Path) -> Result<()> {
        let body = match fs::read_to_string(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for (number, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<Persisted>(line)
                .map_err(|e| e.to_string())
                .and_then(|p| {
                    Message::from_value(p.message)
                        .map(|m| (p.attempts, m))
                        .map_err(|e| e.to_string())
                });
            match entry {
                Ok((attempts, mut message)) => {
                    message.mark_acknowledged();
                    message.set_origin(Origin::Retry);
                    self.penalties.restore(&message.retry_key(), attempts);
                    self.entries.push_back(message);
                }
                Err(e) => warn!(
                    file = %path.display(),
                    line = number + 1,
                    error = %e,
                    "skipping unreadable retry entry"
                ),
            }
        }
        debug!(file = %path.display(), entries = self.entries.len(), "retry queue loaded");
        Ok(())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counted failures recorded for `message`
    pub fn attempts(&self, message: &Message) -> u32 {
        self.penalties.attempts(&message.retry_key())
    }

    /// Record a failure of `message` and decide its fate
    pub fn classify(&mut self, message: &Message, reason: &str) -> Disposition {
        let key = message.retry_key();
        if !message.is_retry {
            let after = self.penalties.postpone(&key, reason);
            return Disposition::Deferred { after };
        }
        match self.penalties.penalize(&key, reason) {
            Verdict::Retry { after, attempts } => Disposition::Retry { after, attempts },
            Verdict::Exhausted { attempts } => {
                self.penalties.clear(&key);
                Disposition::Exhausted { attempts }
            }
        }
    }

    /// Queue a failed, acknowledged message for a later cycle
    pub fn push(&mut self, mut message: Message) {
        message.report = None;
        self.entries.push_back(message);
    }

    /// Stop tracking `message` (it succeeded or was given up on)
    pub fn forget(&mut self, message: &Message) {
        self.penalties.clear(&message.retry_key());
    }

    /// Up to `max` messages whose delay has elapsed, in queue order, flagged
    /// as retries
    pub fn take_eligible(&mut self, max: usize) -> Vec<Message> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        while let Some(mut message) = self.entries.pop_front() {
            if taken.len() < max && self.penalties.is_eligible(&message.retry_key()) {
                message.set_retry(true);
                message.set_origin(Origin::Retry);
                taken.push(message);
            } else {
                kept.push_back(message);
            }
        }
        self.entries = kept;
        taken
    }

    /// Rewrite the persistence file, if any
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.policy.path else {
            return Ok(());
        };

        let mut body = String::new();
        for message in &self.entries {
            let line = serde_json::to_string(&Persisted {
                attempts: self.attempts(message),
                message: message.to_value()?,
            })?;
            body.push_str(&line);
            body.push('\n');
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let staging = path.with_extension("jsonl.tmp");
        fs::write(&staging, body).await?;
        fs::rename(&staging, path).await?;
        Ok(())
    }
}
