//! Flow engine
//!
//! A [`Flow`] drives one pipeline: it pulls a batch from its
//! [`MessageSource`], runs the stage chain over a [`Worklist`], acknowledges
//! every message before anything destructive happens, moves the data, and
//! hands the results to the post stages.
//!
//! ```text
//!   fetch ─► gather/do_poll ─► retries ─► on_messages* ─► ack ─► transfer
//!                                                                  │
//!   retry queue ◄─ failed ◄─ on_report ◄─ post ◄─ on_posts ◄─ on_files
//! ```
//!
//! One flow is one task; cycles never overlap. A stop request is honoured
//! between entry points. A cycle stopped before acknowledgment is abandoned
//! and its messages are redelivered by the source.

pub mod report;
pub mod retry;
pub mod stats;
mod transfer;

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use meridian_core_resilience::{retry_with_backoff, Backoff, BackoffConfig};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{FlowError, Result};
use crate::message::{Message, MessageId, Origin};
use crate::source::MessageSource;
use crate::stage::{EntryPoint, EntryPoints, StageChain, StageResult};
use crate::transfer::{AccelPolicy, Direction, ProviderRegistry, TransferProvider};
use crate::worklist::{Partition, PartitionCounts, Worklist};

pub use report::{Report, ReportEntry};
pub use retry::{Disposition, RetryPolicy, RetryQueue};
pub use stats::FlowStats;

/// Engine knobs of one flow
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    pub name: String,
    /// Most messages a cycle takes on
    pub batch: usize,
    /// Wait after a cycle that found nothing to do
    pub sleep: Duration,
    pub housekeeping: Duration,
    /// Attach transfer reports to messages and run `on_report`
    pub report_back: bool,
    /// Suffix of files being written
    pub inflight: String,
    pub direction: Direction,
    /// Download root for messages without `new_dir`/`new_file`
    pub directory: Option<PathBuf>,
    /// Base URL products are sent to
    pub destination: Option<String>,
    /// Schedule for fetch and acknowledge faults
    pub source_backoff: BackoffConfig,
}

impl FlowSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            batch: 25,
            sleep: Duration::from_secs(1),
            housekeeping: Duration::from_secs(300),
            report_back: true,
            inflight: ".tmp".to_string(),
            direction: Direction::Download,
            directory: None,
            destination: None,
            source_backoff: BackoffConfig::default(),
        }
    }
}

/// How a cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was fetched, gathered or due for retry
    Idle,
    /// The batch went all the way through
    Processed {
        counts: PartitionCounts,
        /// `ok` messages after `deleteOnPost` stripping
        posted: Vec<Message>,
    },
    /// A stop request arrived before the batch was acknowledged
    Abandoned,
}

/// Worklist entry points, which all get the same snapshot isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorklistHook {
    Messages,
    Files,
    Posts,
    Post,
}

impl WorklistHook {
    fn entry_point(self) -> EntryPoint {
        match self {
            WorklistHook::Messages => EntryPoint::OnMessages,
            WorklistHook::Files => EntryPoint::OnFiles,
            WorklistHook::Posts => EntryPoint::OnPosts,
            WorklistHook::Post => EntryPoint::Post,
        }
    }

    fn before_ack(self) -> bool {
        self == WorklistHook::Messages
    }
}

pub struct Flow {
    settings: FlowSettings,
    source: Box<dyn MessageSource>,
    chain: StageChain,
    providers: ProviderRegistry,
    accel: AccelPolicy,
    retry: RetryQueue,
    stats: FlowStats,
    backoff: Backoff,
    next_id: u64,
}

impl Flow {
    /// Build a flow. Providers of `do_get`/`do_put` stages are registered
    /// over the built-in ones in load order, so the last stage to claim a
    /// scheme serves it.
    pub fn new(settings: FlowSettings, source: Box<dyn MessageSource>, chain: StageChain) -> Self {
        let mut providers = ProviderRegistry::with_builtin();
        for (stage, schemes, provider) in chain.providers() {
            debug!(flow = %settings.name, stage = %stage, schemes = ?schemes, "stage provider registered");
            providers.register(schemes, provider);
        }
        let backoff = Backoff::new(settings.source_backoff.clone());

        Self {
            settings,
            source,
            chain,
            providers,
            accel: AccelPolicy::default(),
            retry: RetryQueue::new(RetryPolicy::default()),
            stats: FlowStats::default(),
            backoff,
            next_id: 0,
        }
    }

    pub fn with_accel(mut self, accel: AccelPolicy) -> Self {
        self.accel = accel;
        self
    }

    pub fn with_retry_queue(mut self, retry: RetryQueue) -> Self {
        self.retry = retry;
        self
    }

    /// Register a provider after the stage providers; it wins its schemes
    pub fn with_provider<I, S>(mut self, schemes: I, provider: Arc<dyn TransferProvider>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.providers.register(schemes, provider);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    /// The loaded stages, for pollers driving `on_line`/`on_html_page`
    pub fn stages_mut(&mut self) -> &mut StageChain {
        &mut self.chain
    }

    /// Run cycles until `stop` turns true, then shut down.
    ///
    /// `on_stop` runs for every stage whether the loop ended cleanly or not.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<FlowStats> {
        info!(flow = %self.settings.name, stages = ?self.chain.names(), "flow starting");

        let result = match self.start().await {
            Ok(()) => self.run_loop(&mut stop).await,
            Err(e) => Err(e),
        };
        self.shutdown().await;

        match result {
            Ok(()) => Ok(self.stats),
            Err(e) => {
                error!(flow = %self.settings.name, error = %e, "flow failed");
                Err(e)
            }
        }
    }

    /// Call `on_start` on every stage, in load order
    pub async fn start(&mut self) -> Result<()> {
        for index in self.chain.indices(EntryPoints::ON_START) {
            let Some(loaded) = self.chain.get_mut(index) else {
                continue;
            };
            let name = loaded.name().to_string();
            if let Err(e) = guarded(loaded.stage.on_start()).await {
                return Err(FlowError::StageLoad {
                    stage: name,
                    reason: format!("on_start: {:#}", e),
                });
            }
        }
        Ok(())
    }

    async fn run_loop(&mut self, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let mut last_housekeeping = Instant::now();

        while !stopping(stop) {
            match self.run_cycle(stop).await {
                Ok(CycleOutcome::Idle) => {
                    if pause(stop, self.settings.sleep).await {
                        break;
                    }
                }
                Ok(CycleOutcome::Processed { .. }) => {}
                Ok(CycleOutcome::Abandoned) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(flow = %self.settings.name, error = %e, "cycle failed");
                    if pause(stop, self.settings.sleep).await {
                        break;
                    }
                }
            }

            if last_housekeeping.elapsed() >= self.settings.housekeeping {
                self.housekeeping().await;
                last_housekeeping = Instant::now();
            }
        }
        Ok(())
    }

    /// Run one batch through the whole entry-point sequence
    pub async fn run_cycle(&mut self, stop: &mut watch::Receiver<bool>) -> Result<CycleOutcome> {
        let flow = self.settings.name.clone();

        let Some(mut batch) = self.fetch(stop).await? else {
            return Ok(CycleOutcome::Abandoned);
        };
        self.stats.fetched += batch.len() as u64;
        for message in batch.iter_mut() {
            self.adopt(message, Origin::Source);
        }

        self.gather(&mut batch).await;

        let room = self.settings.batch.saturating_sub(batch.len());
        let mut retries = self.retry.take_eligible(room);
        for message in retries.iter_mut() {
            self.adopt(message, Origin::Retry);
        }
        self.stats.retried += retries.len() as u64;
        batch.extend(retries);

        if batch.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        debug!(flow = %flow, messages = batch.len(), "cycle started");

        let mut worklist = Worklist::with_incoming(batch);
        if stopping(stop) {
            self.abandon(worklist);
            return Ok(CycleOutcome::Abandoned);
        }

        for index in self.chain.indices(EntryPoints::ON_MESSAGES) {
            self.invoke(index, WorklistHook::Messages, &mut worklist).await;
            if stopping(stop) {
                self.abandon(worklist);
                return Ok(CycleOutcome::Abandoned);
            }
        }
        worklist.move_all(Partition::Incoming, Partition::Ok);

        if !self.acknowledge(&mut worklist, stop).await {
            self.abandon(worklist);
            return Ok(CycleOutcome::Abandoned);
        }

        let mut reports = Vec::new();
        self.transfer(&mut worklist, &mut reports).await;

        for index in self.chain.indices(EntryPoints::ON_FILES) {
            self.invoke(index, WorklistHook::Files, &mut worklist).await;
        }

        for index in self.chain.indices(EntryPoints::ON_POSTS) {
            self.invoke(index, WorklistHook::Posts, &mut worklist).await;
        }
        for index in self.chain.indices(EntryPoints::POST) {
            self.invoke(index, WorklistHook::Post, &mut worklist).await;
        }

        // after the post stages, so a failed post counts like a failed transfer
        self.classify_failures(&mut worklist);

        if !reports.is_empty() {
            self.report(&reports).await;
        }

        let counts = worklist.counts();
        let posted = self.settle(worklist).await;
        self.stats.record_outcome(counts);
        self.stats.log(&flow, "cycle complete");

        Ok(CycleOutcome::Processed { counts, posted })
    }

    /// Fetch a batch, riding out transient source faults. `None` when a stop
    /// request arrived while waiting.
    async fn fetch(&mut self, stop: &mut watch::Receiver<bool>) -> Result<Option<Vec<Message>>> {
        loop {
            match self.source.fetch_batch(self.settings.batch).await {
                Ok(batch) => {
                    self.backoff.reset();
                    return Ok(Some(batch));
                }
                Err(e) if e.is_transient() => {
                    self.stats.source_faults += 1;
                    let delay = self.backoff.next_delay();
                    warn!(
                        flow = %self.settings.name,
                        source = self.source.name(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "fetch failed"
                    );
                    if pause(stop, delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Let `gather`/`do_poll` stages add to the batch, in load order
    async fn gather(&mut self, batch: &mut Vec<Message>) {
        let gatherers = self.chain.indices(EntryPoints::GATHER | EntryPoints::DO_POLL);
        for index in gatherers {
            let room = self.settings.batch.saturating_sub(batch.len());
            if room == 0 {
                break;
            }
            let Some(loaded) = self.chain.get_mut(index) else {
                continue;
            };
            let name = loaded.name().to_string();

            let mut gathered = Vec::new();
            for (flag, entry_point) in [
                (EntryPoints::GATHER, EntryPoint::Gather),
                (EntryPoints::DO_POLL, EntryPoint::DoPoll),
            ] {
                if !loaded.implements(flag) {
                    continue;
                }
                let room = room.saturating_sub(gathered.len());
                let call = match entry_point {
                    EntryPoint::Gather => loaded.stage.gather(room),
                    _ => loaded.stage.do_poll(room),
                };
                match guarded(call).await {
                    Ok(mut messages) => {
                        messages.truncate(room);
                        gathered.append(&mut messages);
                    }
                    Err(e) => {
                        self.stats.stage_faults += 1;
                        warn!(
                            flow = %self.settings.name,
                            stage = %name,
                            entry_point = %entry_point,
                            error = format!("{:#}", e),
                            "stage fault"
                        );
                    }
                }
            }

            self.stats.gathered += gathered.len() as u64;
            for mut message in gathered {
                self.adopt(&mut message, Origin::Stage(index));
                batch.push(message);
            }
        }
    }

    /// Run one stage over the worklist against a snapshot.
    ///
    /// On error or panic the worklist goes back to the snapshot. Before
    /// acknowledgment, messages the stage lost are restored into `failed`.
    async fn invoke(&mut self, index: usize, hook: WorklistHook, worklist: &mut Worklist) {
        let Some(loaded) = self.chain.get_mut(index) else {
            return;
        };
        let name = loaded.name().to_string();
        let entry_point = hook.entry_point();
        let snapshot = worklist.clone();

        let call = match hook {
            WorklistHook::Messages => loaded.stage.on_messages(worklist),
            WorklistHook::Files => loaded.stage.on_files(worklist),
            WorklistHook::Posts => loaded.stage.on_posts(worklist),
            WorklistHook::Post => loaded.stage.post(worklist),
        };

        if let Err(e) = guarded(call).await {
            self.stats.stage_faults += 1;
            warn!(
                flow = %self.settings.name,
                stage = %name,
                entry_point = %entry_point,
                error = format!("{:#}", e),
                "stage fault, worklist restored"
            );
            *worklist = snapshot;
            return;
        }

        if hook.before_ack() {
            let reconciliation = worklist.reconcile(&snapshot);
            if !reconciliation.is_clean() {
                self.stats.restored += reconciliation.restored.len() as u64;
                warn!(
                    flow = %self.settings.name,
                    stage = %name,
                    entry_point = %entry_point,
                    restored = reconciliation.restored.len(),
                    duplicates = reconciliation.duplicates.len(),
                    "stage broke worklist membership"
                );
            }
        } else {
            let duplicates = worklist.dedup();
            if !duplicates.is_empty() {
                warn!(
                    flow = %self.settings.name,
                    stage = %name,
                    entry_point = %entry_point,
                    duplicates = duplicates.len(),
                    "duplicate messages removed"
                );
            }
        }

        // messages the stage created itself
        for message in worklist.iter_mut() {
            if !message.id().is_assigned() {
                self.next_id += 1;
                message.set_id(MessageId(self.next_id));
                message.set_origin(Origin::Stage(index));
                if !hook.before_ack() {
                    message.mark_acknowledged();
                }
            }
        }
    }

    /// Acknowledge every message of the batch exactly once. `false` when a
    /// stop request interrupted a faulting source.
    async fn acknowledge(&mut self, worklist: &mut Worklist, stop: &mut watch::Receiver<bool>) -> bool {
        let mut gathered: BTreeMap<usize, Vec<Message>> = BTreeMap::new();
        for (_, message) in worklist.iter() {
            if let (false, Origin::Stage(index)) = (message.is_acknowledged(), message.origin()) {
                gathered.entry(index).or_default().push(message.clone());
            }
        }
        for (index, messages) in gathered {
            self.ack_gathered(index, &messages).await;
        }

        for message in worklist.iter_mut() {
            if message.is_acknowledged() {
                continue;
            }
            if message.origin() == Origin::Source && !self.ack_source(message, stop).await {
                return false;
            }
            message.mark_acknowledged();
        }
        true
    }

    async fn ack_gathered(&mut self, index: usize, messages: &[Message]) {
        let Some(loaded) = self.chain.get_mut(index) else {
            return;
        };
        self.stats.acked += messages.len() as u64;
        if !loaded.implements(EntryPoints::ACK) {
            return;
        }
        let name = loaded.name().to_string();
        if let Err(e) = guarded(loaded.stage.ack(messages)).await {
            self.stats.stage_faults += 1;
            self.stats.ack_failures += messages.len() as u64;
            warn!(
                flow = %self.settings.name,
                stage = %name,
                entry_point = %EntryPoint::Ack,
                messages = messages.len(),
                error = format!("{:#}", e),
                "stage fault"
            );
        }
    }

    /// Acknowledge one source message, retrying transient faults with
    /// backoff. A refused acknowledgment is logged and not retried.
    async fn ack_source(&mut self, message: &Message, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            match self.source.acknowledge(message).await {
                Ok(()) => {
                    self.backoff.reset();
                    self.stats.acked += 1;
                    return true;
                }
                Err(e) if e.is_transient() => {
                    self.stats.source_faults += 1;
                    let delay = self.backoff.next_delay();
                    warn!(
                        flow = %self.settings.name,
                        message = %message.describe(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "acknowledgment failed"
                    );
                    if pause(stop, delay).await {
                        return false;
                    }
                }
                Err(e) => {
                    self.stats.ack_failures += 1;
                    error!(
                        flow = %self.settings.name,
                        message = %message.describe(),
                        error = %e,
                        "acknowledgment refused by source"
                    );
                    return true;
                }
            }
        }
    }

    /// Drop a batch without finishing it. Unacknowledged messages are left
    /// to the source; acknowledged ones go back to the retry queue.
    fn abandon(&mut self, worklist: Worklist) {
        let mut kept = 0;
        for partition in Partition::ALL {
            for message in worklist.partition(partition) {
                if message.is_acknowledged() {
                    self.retry.push(message.clone());
                    kept += 1;
                }
            }
        }
        info!(
            flow = %self.settings.name,
            messages = worklist.len(),
            requeued = kept,
            "cycle abandoned on stop"
        );
    }

    /// Record failures with the retry queue; exhausted messages are rejected
    fn classify_failures(&mut self, worklist: &mut Worklist) {
        let failed = std::mem::take(&mut worklist.failed);
        for message in failed {
            let reason = message
                .report
                .as_ref()
                .map(|r| r.message.clone())
                .unwrap_or_else(|| "failed".to_string());
            match self.retry.classify(&message, &reason) {
                Disposition::Exhausted { attempts } => {
                    self.stats.exhausted += 1;
                    warn!(
                        flow = %self.settings.name,
                        message = %message.describe(),
                        attempts,
                        "retries exhausted, message rejected"
                    );
                    worklist.rejected.push(message);
                }
                Disposition::Retry { after, attempts } => {
                    debug!(
                        flow = %self.settings.name,
                        message = %message.describe(),
                        attempts,
                        retry_in_ms = after.as_millis() as u64,
                        "retry scheduled"
                    );
                    worklist.failed.push(message);
                }
                Disposition::Deferred { .. } => worklist.failed.push(message),
            }
        }
    }

    async fn report(&mut self, reports: &[ReportEntry]) {
        for index in self.chain.indices(EntryPoints::ON_REPORT) {
            let Some(loaded) = self.chain.get_mut(index) else {
                continue;
            };
            let name = loaded.name().to_string();
            if let Err(e) = guarded(loaded.stage.on_report(reports)).await {
                self.stats.stage_faults += 1;
                warn!(
                    flow = %self.settings.name,
                    stage = %name,
                    entry_point = %EntryPoint::OnReport,
                    error = format!("{:#}", e),
                    "stage fault"
                );
            }
        }
    }

    /// End of cycle: strip what was posted, queue what failed, forget the rest
    async fn settle(&mut self, worklist: Worklist) -> Vec<Message> {
        let Worklist {
            incoming,
            ok,
            rejected,
            failed,
        } = worklist;

        let mut posted = Vec::with_capacity(ok.len());
        for mut message in ok {
            self.retry.forget(&message);
            if let Err(e) = message.strip_for_post() {
                warn!(flow = %self.settings.name, message = %message.describe(), error = %e, "not stripped");
            }
            posted.push(message);
        }
        for message in rejected.iter().chain(incoming.iter()) {
            self.retry.forget(message);
        }
        for message in failed {
            self.retry.push(message);
        }

        if let Err(e) = self.retry.persist().await {
            error!(flow = %self.settings.name, error = %e, "retry queue not persisted");
        }
        posted
    }

    /// Periodic maintenance: stages, providers, counters
    pub async fn housekeeping(&mut self) {
        for index in self.chain.indices(EntryPoints::ON_HOUSEKEEPING) {
            let Some(loaded) = self.chain.get_mut(index) else {
                continue;
            };
            let name = loaded.name().to_string();
            if let Err(e) = guarded(loaded.stage.on_housekeeping()).await {
                self.stats.stage_faults += 1;
                warn!(
                    flow = %self.settings.name,
                    stage = %name,
                    entry_point = %EntryPoint::OnHousekeeping,
                    error = format!("{:#}", e),
                    "stage fault"
                );
            }
        }

        for provider in self.providers.providers() {
            if let Err(e) = provider.housekeeping().await {
                warn!(flow = %self.settings.name, provider = provider.name(), error = %e, "provider housekeeping failed");
            }
        }
        self.stats.log(&self.settings.name, "housekeeping");
    }

    /// Stop every stage in reverse load order, close the source, save the
    /// retry queue. Failures are logged and do not stop the rest.
    pub async fn shutdown(&mut self) {
        let mut stoppers = self.chain.indices(EntryPoints::ON_STOP);
        stoppers.reverse();
        for index in stoppers {
            let Some(loaded) = self.chain.get_mut(index) else {
                continue;
            };
            let name = loaded.name().to_string();
            if let Err(e) = guarded(loaded.stage.on_stop()).await {
                warn!(
                    flow = %self.settings.name,
                    stage = %name,
                    entry_point = %EntryPoint::OnStop,
                    error = format!("{:#}", e),
                    "stage fault"
                );
            }
        }

        if let Err(e) = self.source.close().await {
            warn!(flow = %self.settings.name, error = %e, "source did not close cleanly");
        }

        let retry = &self.retry;
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: false,
        });
        if let Err(e) = retry_with_backoff(&mut backoff, Some(3), |_| true, move || retry.persist()).await {
            error!(flow = %self.settings.name, error = %e, "retry queue not persisted at shutdown");
        }

        self.stats.log(&self.settings.name, "flow stopped");
    }

    fn adopt(&mut self, message: &mut Message, origin: Origin) {
        self.next_id += 1;
        message.set_id(MessageId(self.next_id));
        message.set_origin(origin);
    }
}

fn stopping(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleep for `delay` unless a stop request comes first. Returns whether
/// the flow should stop.
async fn pause(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if stopping(stop) {
        return true;
    }
    let woken = tokio::select! {
        _ = tokio::time::sleep(delay) => None,
        changed = stop.changed() => Some(changed.is_ok()),
    };
    match woken {
        // no one left to send a stop
        Some(false) => {
            tokio::time::sleep(delay).await;
            false
        }
        _ => stopping(stop),
    }
}

/// Await a stage call, turning a panic into an error
async fn guarded<T, F>(call: F) -> StageResult<T>
where
    F: Future<Output = StageResult<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryBroker;
    use crate::stage::{Stage, StageChain};
    use async_trait::async_trait;

    struct Panicky;

    #[async_trait]
    impl Stage for Panicky {
        fn name(&self) -> &str {
            "test.panicky"
        }

        fn entry_points(&self) -> EntryPoints {
            EntryPoints::ON_MESSAGES
        }

        async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
            worklist.incoming.clear();
            panic!("boom");
        }
    }

    fn flow_over(broker: &MemoryBroker, chain: StageChain) -> Flow {
        let settings = FlowSettings {
            direction: Direction::None,
            ..FlowSettings::new("test")
        };
        Flow::new(settings, Box::new(broker.source()), chain)
    }

    #[tokio::test]
    async fn test_empty_batch_is_idle() {
        let broker = MemoryBroker::default();
        let mut flow = flow_over(&broker, StageChain::new());
        let (_tx, mut rx) = watch::channel(false);

        assert_eq!(flow.run_cycle(&mut rx).await.unwrap(), CycleOutcome::Idle);
        assert_eq!(flow.stats().cycles, 0);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_isolated() {
        let broker = MemoryBroker::default();
        broker.publish(Message::new("http://h", "a")).unwrap();
        let mut chain = StageChain::new();
        chain.push(Box::new(Panicky)).unwrap();
        let mut flow = flow_over(&broker, chain);
        let (_tx, mut rx) = watch::channel(false);

        match flow.run_cycle(&mut rx).await.unwrap() {
            CycleOutcome::Processed { counts, posted } => {
                assert_eq!(counts.ok, 1);
                assert_eq!(posted[0].rel_path, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(flow.stats().stage_faults, 1);
        assert_eq!(broker.acknowledged().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("text");
        assert_eq!(panic_message(payload.as_ref()), "text");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
