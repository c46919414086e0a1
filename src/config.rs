/*!
 * Configuration types for Meridian
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::{Table, Value};

use crate::error::{FlowError, Result};
use crate::flow::{FlowSettings, RetryPolicy};
use crate::stage::options::parse_size;
use crate::transfer::{AccelPolicy, Direction};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeridianConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// JSON log file; stdout when absent
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Debug logging regardless of `log_level`
    #[serde(default)]
    pub verbose: bool,

    /// Configured pipelines
    #[serde(default, rename = "flow")]
    pub flows: Vec<FlowConfig>,
}

/// One pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,

    /// Most messages per cycle
    #[serde(default = "default_batch")]
    pub batch: usize,

    /// Idle wait when a cycle found nothing
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    #[serde(default = "default_housekeeping_secs")]
    pub housekeeping_secs: u64,

    /// Stage names, in load order
    #[serde(default)]
    pub stages: Vec<String>,

    /// Emit transfer reports
    #[serde(default = "default_true")]
    pub report_back: bool,

    /// Suffix of files being written
    #[serde(default = "default_inflight")]
    pub inflight: String,

    #[serde(default)]
    pub direction: Direction,

    /// Download root for messages without an explicit destination
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Base URL for `direction = "send"`
    #[serde(default)]
    pub destination: Option<String>,

    pub source: SourceConfig,

    #[serde(default)]
    pub accel: AccelConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Flow-wide stage option defaults
    #[serde(default)]
    pub defaults: Table,

    /// Per-stage option overrides, keyed by stage name
    #[serde(default)]
    pub settings: HashMap<String, Table>,
}

/// Where a flow's messages come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Spool directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Directory of JSON message files
    #[default]
    Spool,
    /// In-process broker; only available when embedding
    Memory,
}

/// Size-threshold acceleration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccelConfig {
    /// Size (`"1M"`, `1048576`); absent disables acceleration
    #[serde(default)]
    pub threshold: Option<Value>,

    /// Extra scheme rewrites on top of http→download, https→downloads
    #[serde(default)]
    pub rewrite: BTreeMap<String, String>,
}

/// Retry queue policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// JSON Lines file the queue is kept in
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Counted failures before a message is rejected; absent retries forever
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default = "default_retry_initial_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_retry_max_secs")]
    pub max_delay_secs: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_attempts: None,
            initial_delay_secs: default_retry_initial_secs(),
            max_delay_secs: default_retry_max_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_batch() -> usize {
    25
}

fn default_sleep_secs() -> u64 {
    1
}

fn default_housekeeping_secs() -> u64 {
    300
}

fn default_inflight() -> String {
    ".tmp".to_string()
}

fn default_retry_initial_secs() -> u64 {
    5
}

fn default_retry_max_secs() -> u64 {
    300
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl MeridianConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: MeridianConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for flow in &self.flows {
            if !names.insert(flow.name.as_str()) {
                return Err(FlowError::Config(format!("duplicate flow name '{}'", flow.name)));
            }
            flow.validate()?;
        }
        Ok(())
    }

    pub fn flow(&self, name: &str) -> Option<&FlowConfig> {
        self.flows.iter().find(|f| f.name == name)
    }
}

impl FlowConfig {
    fn invalid(&self, reason: impl std::fmt::Display) -> FlowError {
        FlowError::Config(format!("flow '{}': {}", self.name, reason))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FlowError::Config("flow name is empty".to_string()));
        }
        if self.batch == 0 {
            return Err(self.invalid("batch must be at least 1"));
        }
        match self.source.kind {
            SourceKind::Spool if self.source.dir.is_none() => {
                return Err(self.invalid("spool source needs source.dir"));
            }
            SourceKind::Memory => {
                return Err(self.invalid("memory sources cannot be configured from a file"));
            }
            SourceKind::Spool => {}
        }
        if self.direction == Direction::Send && self.destination.is_none() {
            return Err(self.invalid("direction \"send\" needs destination"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(self.invalid("retry.backoff_factor must be at least 1.0"));
        }
        for stage in self.settings.keys() {
            if !self.stages.contains(stage) {
                return Err(self.invalid(format!("settings for '{}', which is not loaded", stage)));
            }
        }
        self.accel_policy()?;
        Ok(())
    }

    /// Engine settings of this flow
    pub fn settings(&self) -> FlowSettings {
        FlowSettings {
            name: self.name.clone(),
            batch: self.batch,
            sleep: Duration::from_secs(self.sleep_secs),
            housekeeping: Duration::from_secs(self.housekeeping_secs),
            report_back: self.report_back,
            inflight: self.inflight.clone(),
            direction: self.direction,
            directory: self.directory.clone(),
            destination: self.destination.clone(),
            ..FlowSettings::default()
        }
    }

    pub fn accel_policy(&self) -> Result<AccelPolicy> {
        let threshold = match &self.accel.threshold {
            None => None,
            Some(Value::Integer(n)) if *n >= 0 => Some(*n as u64),
            Some(Value::String(s)) => Some(parse_size(s).map_err(|e| self.invalid(format!("accel.threshold: {}", e)))?),
            Some(other) => return Err(self.invalid(format!("accel.threshold: '{}' is not a size", other))),
        };
        let policy = self
            .accel
            .rewrite
            .iter()
            .fold(AccelPolicy::new(threshold), |policy, (from, to)| policy.with_rewrite(from, to));
        Ok(policy)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            path: self.retry.path.clone(),
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_secs(self.retry.initial_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            backoff_factor: self.retry.backoff_factor,
        }
    }
}
