/*!
 * Error types for Meridian
 */

use std::io;
use thiserror::Error;

use crate::message::MessageError;
use crate::source::SourceError;
use crate::stage::options::OptionError;
use crate::transfer::TransferError;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Configuration file or value is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// A configured stage name is not registered
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// A stage factory refused to build, or its capabilities are inconsistent
    #[error("stage '{stage}' failed to load: {reason}")]
    StageLoad { stage: String, reason: String },

    /// A stage option could not be resolved
    #[error(transparent)]
    Option(#[from] OptionError),

    /// The message source failed
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A transfer provider failed
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A message violated its invariants
    #[error(transparent)]
    Message(#[from] MessageError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A stop signal interrupted the flow
    #[error("flow stopped")]
    Stopped,

    /// A flow task panicked or was aborted
    #[error("flow task '{flow}' ended abnormally: {reason}")]
    Task { flow: String, reason: String },
}

impl FlowError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FlowError::Stopped => EXIT_SUCCESS,
            FlowError::Config(_)
            | FlowError::UnknownStage(_)
            | FlowError::StageLoad { .. }
            | FlowError::Option(_)
            | FlowError::Toml(_) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error ends the flow rather than a single cycle
    pub fn is_fatal(&self) -> bool {
        match self {
            FlowError::Config(_)
            | FlowError::UnknownStage(_)
            | FlowError::StageLoad { .. }
            | FlowError::Option(_)
            | FlowError::Toml(_)
            | FlowError::Stopped
            | FlowError::Task { .. } => true,
            FlowError::Source(e) => !e.is_transient(),
            FlowError::Transfer(_)
            | FlowError::Message(_)
            | FlowError::Io(_)
            | FlowError::Json(_) => false,
        }
    }
}
