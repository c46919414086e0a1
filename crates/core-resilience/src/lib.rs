//! Meridian Core Resilience: pure-logic retry primitives
//!
//! # Overview
//!
//! Building blocks the flow engine uses to survive collaborators that fail
//! for a while and then recover:
//!
//! - **Backoff**: exponential reconnect schedule for message-source faults
//! - **Penalization**: per-item retry eligibility with an optional cap on
//!   counted failures
//!
//! This crate has no knowledge of messages, brokers or transfer schemes.
//! Items are identified by plain string keys.
//!
//! ```text
//!   fetch/ack fault ──► Backoff ──► sleep, reconnect, try again
//!
//!   failed item ──► PenaltyBox ──► Retry { after } ──► eligible later
//!                        │
//!                        └──────► Exhausted { attempts } ──► give up
//! ```

pub mod backoff;
pub mod penalization;

pub use backoff::{retry_with_backoff, Backoff, BackoffConfig};
pub use penalization::{PenaltyBox, PenaltyConfig, Verdict};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::backoff::{retry_with_backoff, Backoff, BackoffConfig};
    pub use super::penalization::{PenaltyBox, PenaltyConfig, Verdict};
}
