//! Export module contract and registry.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use meter_common::{MeterError, MeterResult};
use meter_proc::{FlowRecord, ModParams, TimerSpec};
use tracing::debug;

/// Opaque per-rule export state owned by one export module (open files,
/// sequence numbers, format options).
pub trait ExportState: Any + Send {
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
    /// Downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> ExportState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Renders flow records into a wire or file format and writes them to a
/// sink.
pub trait ExportModule: Send + Sync {
    /// Module name used in rule definitions.
    fn name(&self) -> &'static str;

    /// One-time setup on first acquire.
    fn init_module(&self) -> MeterResult<()> {
        Ok(())
    }

    /// Teardown when the last reference is released.
    fn destroy_module(&self) {}

    /// Parse rule parameters into per-rule export state. A failure aborts
    /// the rule install.
    fn init_export_rec(&self, params: &ModParams) -> MeterResult<Box<dyn ExportState>>;

    /// Deliver one record. Errors are logged by the exporter and the
    /// record is discarded; the module stays installed.
    fn export_data(&self, record: &FlowRecord, state: &mut dyn ExportState) -> MeterResult<()>;

    /// Process-wide timers (e.g. periodic file rotation); registered once
    /// when the module is first used.
    fn add_timer_events(&self) -> Vec<TimerSpec> {
        Vec::new()
    }

    /// Invoked when a process-wide module timer fires.
    fn timeout(&self, _timer_id: u32) {}
}

struct Entry {
    module: Arc<dyn ExportModule>,
    refs: u32,
}

/// Export module table with reference counting.
#[derive(Default)]
pub struct ExportRegistry {
    mods: DashMap<String, Entry>,
}

impl ExportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sinks, resolving metric schemas through
    /// `metrics`.
    pub fn builtin(metrics: Arc<meter_proc::ModuleRegistry>) -> Self {
        let reg = Self::new();
        reg.register(Arc::new(crate::sinks::text::TextExport::new(
            metrics.clone(),
        )));
        reg.register(Arc::new(crate::sinks::jsonl::JsonlExport::new(metrics)));
        reg
    }

    /// Make a module available under its name.
    pub fn register(&self, module: Arc<dyn ExportModule>) {
        self.mods
            .insert(module.name().to_string(), Entry { module, refs: 0 });
    }

    /// Acquire a module reference. Returns the module and whether this was
    /// the first acquisition (whose process-wide timers need scheduling).
    pub fn acquire(&self, name: &str) -> MeterResult<(Arc<dyn ExportModule>, bool)> {
        let mut entry = self
            .mods
            .get_mut(name)
            .ok_or_else(|| MeterError::UnknownModule(name.to_string()))?;
        let first = entry.refs == 0;
        if first {
            entry.module.init_module()?;
            debug!(module = name, "export module initialized");
        }
        entry.refs += 1;
        Ok((entry.module.clone(), first))
    }

    /// Release a module reference.
    pub fn release(&self, name: &str) {
        if let Some(mut entry) = self.mods.get_mut(name) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.module.destroy_module();
                debug!(module = name, "export module destroyed");
            }
        }
    }

    /// Reference count of a module (0 when unknown).
    pub fn refcount(&self, name: &str) -> u32 {
        self.mods.get(name).map(|e| e.refs).unwrap_or(0)
    }

    /// Names of all registered modules.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mods.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
