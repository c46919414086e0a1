//! Pluggable processing stages
//!
//! A stage is an independently built unit that implements some of the fixed
//! entry points of the flow lifecycle. Which ones it implements is declared
//! up front as an [`EntryPoints`] capability set; the engine only ever calls
//! an entry point a stage declared, and checks the declaration when the
//! stage is loaded.
//!
//! ```text
//!   gather/do_poll ──► on_messages ──► ack ──► do_get/do_put ──► on_files
//!        │                                        │  (on_data, on_part)
//!        │                                        ▼
//!        └────────────── on_report ◄── post ◄── on_posts
//! ```

pub mod builtin;
pub mod options;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;

use crate::flow::report::ReportEntry;
use crate::message::{Blocks, Message};
use crate::transfer::TransferProvider;
use crate::worklist::Worklist;

pub use options::{OptionError, OptionKind, OptionSchema, OptionValue, StageOptions};
pub use registry::{LoadedStage, StageChain, StageDescriptor, StageFactory, StageRegistry};

/// Errors a stage may return. Stage logic is arbitrary, so any error type is
/// accepted; the engine logs it with the stage and entry point and moves on.
pub type StageResult<T> = anyhow::Result<T>;

bitflags! {
    /// The entry points a stage implements
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryPoints: u32 {
        const ACK             = 1 << 0;
        const DO_POLL         = 1 << 1;
        const GATHER          = 1 << 2;
        const ON_MESSAGES     = 1 << 3;
        const ON_DATA         = 1 << 4;
        const ON_FILES        = 1 << 5;
        const ON_HOUSEKEEPING = 1 << 6;
        const ON_HTML_PAGE    = 1 << 7;
        const ON_LINE         = 1 << 8;
        const ON_PART         = 1 << 9;
        const ON_POSTS        = 1 << 10;
        const ON_REPORT       = 1 << 11;
        const ON_START        = 1 << 12;
        const ON_STOP         = 1 << 13;
        const POST            = 1 << 14;
        const DO_GET          = 1 << 15;
        const DO_PUT          = 1 << 16;
    }
}

impl EntryPoints {
    /// Entry points served per scheme rather than in load order
    pub const SCHEMED: EntryPoints = EntryPoints::DO_GET.union(EntryPoints::DO_PUT);

    /// Parse a list of entry-point names
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        names.into_iter().try_fold(EntryPoints::empty(), |acc, name| {
            EntryPoint::from_name(name).map(|ep| acc | ep.flag())
        })
    }

    /// Names of the declared entry points, in lifecycle vocabulary order
    pub fn names(&self) -> Vec<&'static str> {
        EntryPoint::ALL
            .iter()
            .filter(|ep| self.contains(ep.flag()))
            .map(|ep| ep.name())
            .collect()
    }
}

impl fmt::Display for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(","))
    }
}

/// A single named entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Ack,
    DoPoll,
    Gather,
    OnMessages,
    OnData,
    OnFiles,
    OnHousekeeping,
    OnHtmlPage,
    OnLine,
    OnPart,
    OnPosts,
    OnReport,
    OnStart,
    OnStop,
    Post,
    DoGet,
    DoPut,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 17] = [
        EntryPoint::Ack,
        EntryPoint::DoPoll,
        EntryPoint::Gather,
        EntryPoint::OnMessages,
        EntryPoint::OnData,
        EntryPoint::OnFiles,
        EntryPoint::OnHousekeeping,
        EntryPoint::OnHtmlPage,
        EntryPoint::OnLine,
        EntryPoint::OnPart,
        EntryPoint::OnPosts,
        EntryPoint::OnReport,
        EntryPoint::OnStart,
        EntryPoint::OnStop,
        EntryPoint::Post,
        EntryPoint::DoGet,
        EntryPoint::DoPut,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EntryPoint::Ack => "ack",
            EntryPoint::DoPoll => "do_poll",
            EntryPoint::Gather => "gather",
            EntryPoint::OnMessages => "on_messages",
            EntryPoint::OnData => "on_data",
            EntryPoint::OnFiles => "on_files",
            EntryPoint::OnHousekeeping => "on_housekeeping",
            EntryPoint::OnHtmlPage => "on_html_page",
            EntryPoint::OnLine => "on_line",
            EntryPoint::OnPart => "on_part",
            EntryPoint::OnPosts => "on_posts",
            EntryPoint::OnReport => "on_report",
            EntryPoint::OnStart => "on_start",
            EntryPoint::OnStop => "on_stop",
            EntryPoint::Post => "post",
            EntryPoint::DoGet => "do_get",
            EntryPoint::DoPut => "do_put",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        EntryPoint::ALL.into_iter().find(|ep| ep.name() == name)
    }

    pub fn flag(&self) -> EntryPoints {
        match self {
            EntryPoint::Ack => EntryPoints::ACK,
            EntryPoint::DoPoll => EntryPoints::DO_POLL,
            EntryPoint::Gather => EntryPoints::GATHER,
            EntryPoint::OnMessages => EntryPoints::ON_MESSAGES,
            EntryPoint::OnData => EntryPoints::ON_DATA,
            EntryPoint::OnFiles => EntryPoints::ON_FILES,
            EntryPoint::OnHousekeeping => EntryPoints::ON_HOUSEKEEPING,
            EntryPoint::OnHtmlPage => EntryPoints::ON_HTML_PAGE,
            EntryPoint::OnLine => EntryPoints::ON_LINE,
            EntryPoint::OnPart => EntryPoints::ON_PART,
            EntryPoint::OnPosts => EntryPoints::ON_POSTS,
            EntryPoint::OnReport => EntryPoints::ON_REPORT,
            EntryPoint::OnStart => EntryPoints::ON_START,
            EntryPoint::OnStop => EntryPoints::ON_STOP,
            EntryPoint::Post => EntryPoints::POST,
            EntryPoint::DoGet => EntryPoints::DO_GET,
            EntryPoint::DoPut => EntryPoints::DO_PUT,
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A processing stage.
///
/// Every method has a no-op default. A stage overrides the methods for the
/// entry points it lists in [`Stage::entry_points`]; the engine never calls
/// the others. Stages are driven by a single flow task, one call at a time.
#[async_trait]
pub trait Stage: Send {
    /// Fully-qualified stage name, e.g. `msg.fdelay`
    fn name(&self) -> &str;

    /// Entry points this stage implements
    fn entry_points(&self) -> EntryPoints;

    async fn on_start(&mut self) -> StageResult<()> {
        Ok(())
    }

    async fn on_stop(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Produce up to `max` messages for `incoming`
    async fn gather(&mut self, _max: usize) -> StageResult<Vec<Message>> {
        Ok(Vec::new())
    }

    /// Poll a remote listing for up to `max` new products
    async fn do_poll(&mut self, _max: usize) -> StageResult<Vec<Message>> {
        Ok(Vec::new())
    }

    /// Acknowledge messages this stage produced through `gather`/`do_poll`
    async fn ack(&mut self, _messages: &[Message]) -> StageResult<()> {
        Ok(())
    }

    /// Partition the batch. Must not drop messages.
    async fn on_messages(&mut self, _worklist: &mut Worklist) -> StageResult<()> {
        Ok(())
    }

    /// Called after the transfer step
    async fn on_files(&mut self, _worklist: &mut Worklist) -> StageResult<()> {
        Ok(())
    }

    /// Adjust `ok`/`failed` after acknowledgment; may drop from `ok`
    async fn on_posts(&mut self, _worklist: &mut Worklist) -> StageResult<()> {
        Ok(())
    }

    /// Publish `ok` downstream
    async fn post(&mut self, _worklist: &mut Worklist) -> StageResult<()> {
        Ok(())
    }

    /// Called after each block of a partitioned transfer lands
    async fn on_part(&mut self, _message: &Message, _blocks: &Blocks) -> StageResult<()> {
        Ok(())
    }

    async fn on_report(&mut self, _reports: &[ReportEntry]) -> StageResult<()> {
        Ok(())
    }

    async fn on_housekeeping(&mut self) -> StageResult<()> {
        Ok(())
    }

    /// Canonicalise one line of a remote listing; `None` drops the line
    fn on_line(&mut self, line: String) -> StageResult<Option<String>> {
        Ok(Some(line))
    }

    /// Transform a fetched listing page before it is parsed
    fn on_html_page(&mut self, page: String) -> StageResult<String> {
        Ok(page)
    }

    /// Transform transferred data
    fn on_data(&mut self, data: Bytes) -> StageResult<Bytes> {
        Ok(data)
    }

    /// The provider behind `do_get`/`do_put`, for stages declaring either
    fn transfer_provider(&self) -> Option<Arc<dyn TransferProvider>> {
        None
    }
}
