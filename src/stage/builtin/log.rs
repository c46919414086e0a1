//! `msg.log`: log messages as they pass and keep running totals

use async_trait::async_trait;
use tracing::info;

use crate::flow::report::ReportEntry;
use crate::stage::options::{OptionKind, OptionSchema, OptionValue, StageOptions};
use crate::stage::registry::StageDescriptor;
use crate::stage::{EntryPoints, Stage, StageResult};
use crate::worklist::Worklist;

pub const NAME: &str = "msg.log";

pub(super) fn descriptor() -> StageDescriptor {
    StageDescriptor::new(
        NAME,
        "log each message received and posted, with periodic totals",
        MessageLog::ENTRY_POINTS,
        OptionSchema::new().option(
            "log_each",
            OptionKind::Bool,
            OptionValue::Bool(true),
            "log every message, not only totals",
        ),
        |options| Ok(Box::new(MessageLog::from_options(&options)?) as Box<dyn Stage>),
    )
}

#[derive(Debug, Default)]
pub struct MessageLog {
    log_each: bool,
    received: u64,
    posted: u64,
    reports: u64,
}

impl MessageLog {
    const ENTRY_POINTS: EntryPoints = EntryPoints::ON_START
        .union(EntryPoints::ON_MESSAGES)
        .union(EntryPoints::ON_POSTS)
        .union(EntryPoints::ON_REPORT)
        .union(EntryPoints::ON_HOUSEKEEPING)
        .union(EntryPoints::ON_STOP);

    pub fn from_options(options: &StageOptions) -> StageResult<Self> {
        Ok(Self {
            log_each: options.flag("log_each")?,
            ..Self::default()
        })
    }

    fn totals(&self, when: &str) {
        info!(
            stage = NAME,
            received = self.received,
            posted = self.posted,
            reports = self.reports,
            "{}",
            when
        );
    }
}

#[async_trait]
impl Stage for MessageLog {
    fn name(&self) -> &str {
        NAME
    }

    fn entry_points(&self) -> EntryPoints {
        Self::ENTRY_POINTS
    }

    async fn on_start(&mut self) -> StageResult<()> {
        info!(stage = NAME, log_each = self.log_each, "started");
        Ok(())
    }

    async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        self.received += worklist.incoming.len() as u64;
        if self.log_each {
            for message in &worklist.incoming {
                info!(
                    message = %message.describe(),
                    url = %message.retrieval_url(),
                    pub_time = %message.pub_time,
                    "received"
                );
            }
        }
        Ok(())
    }

    async fn on_posts(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        self.posted += worklist.ok.len() as u64;
        if self.log_each {
            for message in &worklist.ok {
                info!(message = %message.describe(), "posting");
            }
        }
        Ok(())
    }

    async fn on_report(&mut self, reports: &[ReportEntry]) -> StageResult<()> {
        self.reports += reports.len() as u64;
        if self.log_each {
            for entry in reports {
                info!(
                    message = %entry.rel_path,
                    code = entry.report.code,
                    reason = %entry.report.message,
                    "report"
                );
            }
        }
        Ok(())
    }

    async fn on_housekeeping(&mut self) -> StageResult<()> {
        self.totals("housekeeping");
        Ok(())
    }

    async fn on_stop(&mut self) -> StageResult<()> {
        self.totals("stopping");
        Ok(())
    }
}
