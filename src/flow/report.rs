//! Transfer outcome reports
//!
//! When `report_back` is enabled the engine attaches a [`Report`] to each
//! message it transferred (or failed to) and hands the cycle's reports to
//! every `on_report` stage.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::message::{format_timestr, Message, MessageId};

/// Product retrieved
pub const CODE_DOWNLOADED: u16 = 201;
/// Product sent to its destination
pub const CODE_SENT: u16 = 201;
/// Transfer failed, will be retried
pub const CODE_TRANSFER_FAILED: u16 = 499;

/// Outcome report carried on a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub code: u16,
    pub message: String,
    pub timestamp: String,
}

impl Report {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            timestamp: format_timestr(Utc::now()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// A report together with the identity of the message it describes
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub message_id: MessageId,
    pub rel_path: String,
    pub report: Report,
}

impl ReportEntry {
    /// Attach `report` to `message` and return the entry for `on_report`
    pub fn attach(message: &mut Message, report: Report) -> Self {
        message.report = Some(report.clone());
        Self {
            message_id: message.id(),
            rel_path: message.rel_path.clone(),
            report,
        }
    }
}
