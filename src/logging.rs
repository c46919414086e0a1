//! Log output for the `meridian` binary
//!
//! Without a `log_file`, compact human-readable lines go to stdout. With
//! one, every event is appended to that file as a JSON object carrying
//! thread, source location and span-close timings. `RUST_LOG` replaces the
//! configured filter when set.

use std::fs::File;
use std::path::Path;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::MeridianConfig;
use crate::error::{FlowError, Result};

/// Where events end up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink<'a> {
    Console,
    JsonFile(&'a Path),
}

impl<'a> Sink<'a> {
    fn of(config: &'a MeridianConfig) -> Self {
        match config.log_file.as_deref() {
            Some(path) => Sink::JsonFile(path),
            None => Sink::Console,
        }
    }
}

/// Level of the `meridian` target; `verbose` wins over `log_level`
pub fn effective_level(config: &MeridianConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.to_tracing_level()
    }
}

fn directive(config: &MeridianConfig) -> String {
    format!("meridian={}", effective_level(config))
}

/// Install the global subscriber. Call once, before any flow starts.
pub fn init_logging(config: &MeridianConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(config)))
        .map_err(|e| FlowError::Config(format!("invalid log filter: {}", e)))?;

    match Sink::of(config) {
        Sink::Console => {
            let layer = fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::NONE)
                .compact();
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        Sink::JsonFile(path) => {
            let layer = fmt::layer()
                .with_writer(open_log(path)?)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE)
                .json();
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
    Ok(())
}

// appended, never truncated
fn open_log(path: &Path) -> Result<File> {
    File::options()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FlowError::Config(format!("cannot open log file {}: {}", path.display(), e)))
}
