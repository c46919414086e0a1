//! Penalization: retry eligibility for items that failed and will be tried again
//!
//! A failed item is not retried immediately. It is "penalized": given a
//! `retry_after` instant that grows exponentially with the number of counted
//! failures. Items that were merely deferred (the work was not attempted, e.g.
//! a product that is not old enough yet) are postponed without consuming an
//! attempt.
//!
//! # Key Concepts
//!
//! - **Penalty Duration**: Delay before a penalized item becomes eligible again
//! - **Max Penalties**: After N counted failures the item is exhausted;
//!   `None` means it is retried forever
//! - **Cooperative**: Callers skip ineligible items, nothing blocks
//!
//! # Example
//!
//! ```
//! use meridian_core_resilience::penalization::{PenaltyBox, PenaltyConfig, Verdict};
//! use std::time::Duration;
//!
//! let mut penalty_box = PenaltyBox::new(PenaltyConfig {
//!     initial_delay: Duration::from_secs(5),
//!     max_delay: Duration::from_secs(300),
//!     backoff_factor: 2.0,
//!     max_penalties: Some(5),
//! });
//!
//! let verdict = penalty_box.penalize("obs/a.txt", "connection refused");
//! assert!(matches!(verdict, Verdict::Retry { .. }));
//! assert!(!penalty_box.is_eligible("obs/a.txt"));
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Delay schedule and exhaustion cap
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyConfig {
    /// Delay after the first counted failure (and for postponed items)
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    pub max_delay: Duration,

    /// Growth of the delay per counted failure
    pub backoff_factor: f64,

    /// Counted failures tolerated before the item is exhausted
    pub max_penalties: Option<u32>,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            max_penalties: None,
        }
    }
}

/// Outcome of penalizing an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Try again once `after` has elapsed
    Retry { after: Duration, attempts: u32 },
    /// Counted failures exceeded `max_penalties`
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone)]
struct PenaltyRecord {
    penalty_count: u32,
    retry_after: Instant,
    reason: String,
}

/// Per-key failure counts and the instant each key may be tried again
#[derive(Debug)]
pub struct PenaltyBox {
    config: PenaltyConfig,
    records: HashMap<String, PenaltyRecord>,
}

impl PenaltyBox {
    pub fn new(config: PenaltyConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
        }
    }

    fn record_mut(&mut self, key: &str) -> &mut PenaltyRecord {
        self.records
            .entry(key.to_string())
            .or_insert_with(|| PenaltyRecord {
                penalty_count: 0,
                retry_after: Instant::now(),
                reason: String::new(),
            })
    }

    /// Count a failure against `key`.
    pub fn penalize(&mut self, key: &str, error: &str) -> Verdict {
        let config = self.config.clone();
        let record = self.record_mut(key);

        record.penalty_count += 1;
        record.reason = error.to_string();
        let attempts = record.penalty_count;

        if config.max_penalties.is_some_and(|max| attempts > max) {
            return Verdict::Exhausted { attempts };
        }

        let delay = if attempts == 1 {
            config.initial_delay
        } else {
            let factor = config.backoff_factor.powi(attempts as i32 - 1);
            let delay_ms = (config.initial_delay.as_millis() as f64 * factor) as u64;
            Duration::from_millis(delay_ms).min(config.max_delay)
        };

        record.retry_after = Instant::now() + delay;

        Verdict::Retry {
            after: delay,
            attempts,
        }
    }

    /// Defer `key` by the initial delay without counting a failure.
    pub fn postpone(&mut self, key: &str, reason: &str) -> Duration {
        let delay = self.config.initial_delay;
        let record = self.record_mut(key);
        record.reason = reason.to_string();
        record.retry_after = Instant::now() + delay;
        delay
    }

    /// Unknown keys are always eligible
    pub fn is_eligible(&self, key: &str) -> bool {
        match self.records.get(key) {
            None => true,
            Some(record) => Instant::now() >= record.retry_after,
        }
    }

    /// Counted failures for `key` so far
    pub fn attempts(&self, key: &str) -> u32 {
        self.records.get(key).map_or(0, |r| r.penalty_count)
    }

    /// Seed a counted-failure total, e.g. when reloading a persisted queue.
    pub fn restore(&mut self, key: &str, attempts: u32) {
        if attempts > 0 {
            self.record_mut(key).penalty_count = attempts;
        }
    }

    /// Reason given with the last failure or postponement of `key`
    pub fn last_reason(&self, key: &str) -> Option<&str> {
        self.records.get(key).map(|r| r.reason.as_str())
    }

    /// Forget `key` once it succeeded or was given up on
    pub fn clear(&mut self, key: &str) {
        self.records.remove(key);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

}
