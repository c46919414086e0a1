//! Flow supervision
//!
//! Every configured flow runs as its own tokio task so a slow transfer in
//! one never holds up another. All flows share one stop signal; the first
//! flow to fail fatally stops the others.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};

use crate::config::{FlowConfig, MeridianConfig, SourceKind};
use crate::error::{FlowError, Result};
use crate::flow::{Flow, FlowStats, RetryQueue};
use crate::source::spool::SpoolSource;
use crate::source::MessageSource;
use crate::stage::StageRegistry;

/// Cloneable handle that asks every flow to stop
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// Build a flow from its configuration: load its stages, open its source
/// and its retry queue
pub async fn build_flow(config: &FlowConfig, registry: &StageRegistry) -> Result<Flow> {
    let chain = registry.load_chain(&config.stages, &config.defaults, &config.settings)?;

    let source: Box<dyn MessageSource> = match (config.source.kind, &config.source.dir) {
        (SourceKind::Spool, Some(dir)) => Box::new(SpoolSource::new(dir)),
        (SourceKind::Spool, None) => {
            return Err(FlowError::Config(format!(
                "flow '{}': spool source needs source.dir",
                config.name
            )))
        }
        (SourceKind::Memory, _) => {
            return Err(FlowError::Config(format!(
                "flow '{}': memory sources cannot be configured from a file",
                config.name
            )))
        }
    };

    let retry = RetryQueue::open(config.retry_policy()).await?;
    Ok(Flow::new(config.settings(), source, chain)
        .with_accel(config.accel_policy()?)
        .with_retry_queue(retry))
}

/// Runs flows concurrently until they are stopped
pub struct Supervisor {
    flows: Vec<Flow>,
    stop: StopHandle,
    stop_rx: watch::Receiver<bool>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            flows: Vec::new(),
            stop: StopHandle(Arc::new(tx)),
            stop_rx: rx,
        }
    }

    /// Build every flow of `config`
    pub async fn from_config(config: &MeridianConfig, registry: &StageRegistry) -> Result<Self> {
        let mut supervisor = Self::new();
        for flow in &config.flows {
            supervisor.add(build_flow(flow, registry).await?);
        }
        Ok(supervisor)
    }

    pub fn add(&mut self, flow: Flow) {
        self.flows.push(flow);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run every flow to completion. Returns each flow's final counters, or
    /// the first error once all flows have shut down.
    pub async fn run(self) -> Result<Vec<(String, FlowStats)>> {
        let Supervisor {
            flows,
            stop,
            stop_rx,
        } = self;

        let mut tasks = JoinSet::new();
        for flow in flows {
            let name = flow.name().to_string();
            let span = info_span!("flow", flow = %name);
            let rx = stop_rx.clone();
            tasks.spawn(
                async move {
                    let result = AssertUnwindSafe(flow.run(rx)).catch_unwind().await;
                    let result = result.unwrap_or_else(|_| {
                        Err(FlowError::Task {
                            flow: name.clone(),
                            reason: "panicked".to_string(),
                        })
                    });
                    (name, result)
                }
                .instrument(span),
            );
        }
        info!(flows = tasks.len(), "flows running");

        let mut finished = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => (
                    "unknown".to_string(),
                    Err(FlowError::Task {
                        flow: "unknown".to_string(),
                        reason: e.to_string(),
                    }),
                ),
            };
            match result {
                Ok(stats) => {
                    info!(flow = %name, cycles = stats.cycles, "flow finished");
                    finished.push((name, stats));
                }
                Err(e) => {
                    error!(flow = %name, error = %e, "flow ended with error, stopping the rest");
                    stop.stop();
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }
}
