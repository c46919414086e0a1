/*!
 * Meridian - message-driven data distribution
 *
 * A pipeline library with:
 * - Batch flows pulled from a message source and acknowledged exactly once
 * - Pluggable stages with declared entry points and scoped options
 * - Scheme-routed transfer providers with size-threshold acceleration
 * - A durable retry queue with an optional cap on attempts
 * - One task per flow, sharing a stop signal
 */

pub mod config;
pub mod error;
pub mod flow;
pub mod logging;
pub mod message;
pub mod source;
pub mod stage;
pub mod supervisor;
pub mod transfer;
pub mod worklist;

// Re-export commonly used types
pub use config::{FlowConfig, LogLevel, MeridianConfig};
pub use error::{FlowError, Result};
pub use flow::{CycleOutcome, Flow, FlowSettings, FlowStats};
pub use message::{Message, MessageId};
pub use stage::{EntryPoint, EntryPoints, Stage, StageChain, StageRegistry};
pub use supervisor::{StopHandle, Supervisor};
pub use transfer::{AccelPolicy, ProviderRegistry, TransferProvider};
pub use worklist::{Partition, Worklist};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
