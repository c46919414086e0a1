//! Stage registry and load-ordered chains
//!
//! Stages are looked up by qualified name, get their options resolved from
//! the flow configuration and are instantiated through a factory. The
//! resulting [`StageChain`] keeps them in load order; that order is the
//! invocation order for every non-schemed entry point.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use toml::Table;
use tracing::{debug, warn};

use super::builtin;
use super::options::{OptionSchema, StageOptions};
use super::{EntryPoint, EntryPoints, Stage, StageResult};
use crate::error::{FlowError, Result};
use crate::transfer::TransferProvider;

/// Factory function type for creating stages from resolved options
pub type StageFactory =
    Arc<dyn Fn(StageOptions) -> anyhow::Result<Box<dyn Stage>> + Send + Sync>;

/// Everything needed to list, validate and build a stage
#[derive(Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub summary: String,
    pub entry_points: EntryPoints,
    pub schema: OptionSchema,
    pub factory: StageFactory,
}

impl StageDescriptor {
    pub fn new<F>(
        name: impl Into<String>,
        summary: impl Into<String>,
        entry_points: EntryPoints,
        schema: OptionSchema,
        factory: F,
    ) -> Self
    where
        F: Fn(StageOptions) -> anyhow::Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            summary: summary.into(),
            entry_points,
            schema,
            factory: Arc::new(factory),
        }
    }
}

impl std::fmt::Debug for StageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDescriptor")
            .field("name", &self.name)
            .field("entry_points", &self.entry_points)
            .finish()
    }
}

/// Stage registry for resolving names to factories
///
/// # Example
///
/// ```
/// use meridian::stage::StageRegistry;
///
/// let registry = StageRegistry::with_builtin();
/// assert!(registry.is_registered("msg.fdelay"));
/// ```
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: BTreeMap<String, StageDescriptor>,
}

impl StageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in stages
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_builtin();
        registry
    }

    fn register_builtin(&mut self) {
        for descriptor in builtin::descriptors() {
            self.register(descriptor);
        }
    }

    /// Register a stage; replaces an earlier registration of the same name
    pub fn register(&mut self, descriptor: StageDescriptor) {
        let name = descriptor.name.clone();
        if self.stages.insert(name.clone(), descriptor).is_some() {
            debug!(stage = %name, "stage registration replaced");
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.get(name)
    }

    /// Registered stages, sorted by name
    pub fn list(&self) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.values()
    }

    /// Resolve options for `name` without building the stage
    pub fn resolve_options(
        &self,
        name: &str,
        defaults: &Table,
        settings: &HashMap<String, Table>,
    ) -> Result<StageOptions> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| FlowError::UnknownStage(name.to_string()))?;
        Ok(descriptor
            .schema
            .resolve(name, defaults, settings.get(name))?)
    }

    /// Build one stage with options resolved from `defaults` and the
    /// `settings` entry keyed by `name`
    pub fn load(
        &self,
        name: &str,
        defaults: &Table,
        settings: &HashMap<String, Table>,
    ) -> Result<Box<dyn Stage>> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| FlowError::UnknownStage(name.to_string()))?;
        let options = descriptor
            .schema
            .resolve(name, defaults, settings.get(name))?;

        let stage = (descriptor.factory)(options).map_err(|e| FlowError::StageLoad {
            stage: name.to_string(),
            reason: format!("{:#}", e),
        })?;

        if stage.entry_points() != descriptor.entry_points {
            return Err(FlowError::StageLoad {
                stage: name.to_string(),
                reason: format!(
                    "instance implements [{}] but was registered with [{}]",
                    stage.entry_points(),
                    descriptor.entry_points
                ),
            });
        }
        Ok(stage)
    }

    /// Build every stage of `names`, in order
    pub fn load_chain<S: AsRef<str>>(
        &self,
        names: &[S],
        defaults: &Table,
        settings: &HashMap<String, Table>,
    ) -> Result<StageChain> {
        let mut chain = StageChain::new();
        for name in names {
            let stage = self.load(name.as_ref(), defaults, settings)?;
            chain.push(stage)?;
        }
        Ok(chain)
    }
}

/// A stage at its position in the chain
pub struct LoadedStage {
    pub index: usize,
    pub entry_points: EntryPoints,
    pub stage: Box<dyn Stage>,
}

impl LoadedStage {
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn implements(&self, entry_point: EntryPoints) -> bool {
        self.entry_points.intersects(entry_point)
    }
}

/// Stages of one flow, in load order
#[derive(Default)]
pub struct StageChain {
    stages: Vec<LoadedStage>,
}

impl StageChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage, checking its declared capabilities
    pub fn push(&mut self, stage: Box<dyn Stage>) -> Result<usize> {
        let entry_points = stage.entry_points();
        if entry_points.is_empty() {
            return Err(FlowError::StageLoad {
                stage: stage.name().to_string(),
                reason: "implements no entry points".to_string(),
            });
        }

        if entry_points.intersects(EntryPoints::SCHEMED) {
            let schemes = stage
                .transfer_provider()
                .map(|p| p.schemes())
                .unwrap_or_default();
            if schemes.is_empty() {
                return Err(FlowError::StageLoad {
                    stage: stage.name().to_string(),
                    reason: "declares do_get/do_put without a provider serving any scheme"
                        .to_string(),
                });
            }
        }

        let index = self.stages.len();
        debug!(
            stage = stage.name(),
            index,
            entry_points = %entry_points,
            "stage loaded"
        );
        self.stages.push(LoadedStage {
            index,
            entry_points,
            stage,
        });
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(LoadedStage::name).collect()
    }

    /// Load positions of the stages implementing `entry_point`, in load order
    pub fn indices(&self, entry_point: EntryPoints) -> Vec<usize> {
        self.stages
            .iter()
            .filter(|s| s.implements(entry_point))
            .map(|s| s.index)
            .collect()
    }

    pub fn any(&self, entry_point: EntryPoints) -> bool {
        self.stages.iter().any(|s| s.implements(entry_point))
    }

    pub fn get(&self, index: usize) -> Option<&LoadedStage> {
        self.stages.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut LoadedStage> {
        self.stages.get_mut(index)
    }

    /// Transfer providers of `do_get`/`do_put` stages, in load order, paired
    /// with the schemes they serve
    pub fn providers(&self) -> Vec<(String, Vec<String>, Arc<dyn TransferProvider>)> {
        self.stages
            .iter()
            .filter(|s| s.implements(EntryPoints::SCHEMED))
            .filter_map(|s| {
                s.stage
                    .transfer_provider()
                    .map(|p| (s.name().to_string(), p.schemes(), p))
            })
            .collect()
    }

    /// Run `line` through every `on_line` stage. A stage that fails leaves
    /// the line as it was; a stage returning `None` drops it.
    pub fn apply_line(&mut self, line: String) -> Option<String> {
        let mut current = line;
        for loaded in self.stages.iter_mut() {
            if !loaded.implements(EntryPoints::ON_LINE) {
                continue;
            }
            let name = loaded.name().to_string();
            let input = current.clone();
            let stage = &mut loaded.stage;
            match isolate(&name, EntryPoint::OnLine, || stage.on_line(input)) {
                Some(Some(next)) => current = next,
                Some(None) => return None,
                None => {}
            }
        }
        Some(current)
    }

    /// Run a listing page through every `on_html_page` stage
    pub fn apply_html_page(&mut self, page: String) -> String {
        let mut current = page;
        for loaded in self.stages.iter_mut() {
            if !loaded.implements(EntryPoints::ON_HTML_PAGE) {
                continue;
            }
            let name = loaded.name().to_string();
            let input = current.clone();
            let stage = &mut loaded.stage;
            if let Some(next) = isolate(&name, EntryPoint::OnHtmlPage, || stage.on_html_page(input)) {
                current = next;
            }
        }
        current
    }

    /// Run transferred data through every `on_data` stage
    pub fn apply_data(&mut self, data: Bytes) -> Bytes {
        let mut current = data;
        for loaded in self.stages.iter_mut() {
            if !loaded.implements(EntryPoints::ON_DATA) {
                continue;
            }
            let name = loaded.name().to_string();
            let input = current.clone();
            let stage = &mut loaded.stage;
            if let Some(next) = isolate(&name, EntryPoint::OnData, || stage.on_data(input)) {
                current = next;
            }
        }
        current
    }
}

/// Call a synchronous hook, turning an error or a panic into `None`
fn isolate<T, F>(stage: &str, entry_point: EntryPoint, hook: F) -> Option<T>
where
    F: FnOnce() -> StageResult<T>,
{
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(
                stage,
                entry_point = %entry_point,
                error = %format!("{:#}", e),
                "stage hook failed, input kept"
            );
            None
        }
        Err(_) => {
            warn!(stage, entry_point = %entry_point, "stage hook panicked, input kept");
            None
        }
    }
}
