//! Per-flow counters

use serde::Serialize;
use tracing::info;

use crate::worklist::PartitionCounts;

/// Running totals for one flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowStats {
    pub cycles: u64,
    pub fetched: u64,
    pub gathered: u64,
    pub retried: u64,
    pub acked: u64,
    pub ack_failures: u64,
    pub ok: u64,
    pub rejected: u64,
    pub failed: u64,
    pub exhausted: u64,
    pub transfers: u64,
    pub transfer_failures: u64,
    pub bytes: u64,
    pub stage_faults: u64,
    pub restored: u64,
    pub source_faults: u64,
}

impl FlowStats {
    /// Fold a finished cycle's final partitions into the totals
    pub fn record_outcome(&mut self, counts: PartitionCounts) {
        self.cycles += 1;
        self.ok += counts.ok as u64;
        self.rejected += counts.rejected as u64;
        self.failed += counts.failed as u64;
    }

    pub fn log(&self, flow: &str, when: &str) {
        info!(
            flow,
            cycles = self.cycles,
            fetched = self.fetched,
            gathered = self.gathered,
            retried = self.retried,
            acked = self.acked,
            ok = self.ok,
            rejected = self.rejected,
            failed = self.failed,
            exhausted = self.exhausted,
            transfers = self.transfers,
            bytes = self.bytes,
            stage_faults = self.stage_faults,
            source_faults = self.source_faults,
            "{}",
            when
        );
    }
}
