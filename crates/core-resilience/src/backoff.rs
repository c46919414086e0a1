//! Backoff: exponential delay schedule for reconnect-and-retry loops
//!
//! Used wherever a remote collaborator (a message broker, a spool directory on
//! a flaky mount) is expected to come back on its own. The schedule starts at
//! `initial`, multiplies by `factor` after every failure and never exceeds
//! `max`. A success resets it.
//!
//! # Example
//!
//! ```
//! use meridian_core_resilience::backoff::{Backoff, BackoffConfig};
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(BackoffConfig {
//!     initial: Duration::from_secs(1),
//!     max: Duration::from_secs(60),
//!     factor: 2.0,
//!     jitter: false,
//! });
//!
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(2));
//! assert_eq!(backoff.next_delay(), Duration::from_secs(4));
//!
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_secs(1));
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Configuration for a backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial: Duration,

    /// Upper bound for any single delay
    pub max: Duration,

    /// Multiplier applied after each failure
    pub factor: f64,

    /// Add up to 10% random jitter to each delay
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: false,
        }
    }
}

/// Stateful exponential backoff schedule
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a schedule positioned at its first delay
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial.min(config.max);
        Self {
            config,
            current,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);

        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.config.factor);
        self.current = grown.min(self.config.max);

        if self.config.jitter && !delay.is_zero() {
            let spread = delay.as_secs_f64() * 0.1;
            let extra = rand::rng().random_range(0.0..=spread);
            return (delay + Duration::from_secs_f64(extra)).min(self.config.max);
        }
        delay
    }

    /// Start over from the initial delay (call after a success)
    pub fn reset(&mut self) {
        self.current = self.config.initial.min(self.config.max);
        self.failures = 0;
    }

    /// Number of failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// The configuration this schedule was built from
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// Run `op` until it succeeds, sleeping per `backoff` between attempts.
///
/// `max_attempts = None` retries forever. Errors for which `retriable`
/// returns `false` are returned immediately.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: &mut Backoff,
    max_attempts: Option<u32>,
    retriable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(e) => {
                let exhausted = max_attempts.is_some_and(|max| attempt >= max);
                if exhausted || !retriable(&e) {
                    return Err(e);
                }
                let delay = backoff.next_delay();
                tracing::debug!(attempt, ?delay, "operation failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
