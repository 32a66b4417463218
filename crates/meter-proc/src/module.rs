//! Metric module contract and registry.
//!
//! A metric module aggregates per-flow measurements packet by packet and
//! renders them against its declared schema. Per-flow state is an owned
//! value whose concrete type only the module knows; it travels as a boxed
//! trait object and the module downcasts it back on every invocation.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use meter_common::{MeterError, MeterResult, PacketMeta};
use tracing::debug;

use crate::schema::TypeInfo;
use crate::wire::RecordWriter;

/// Module parameters from the rule definition.
pub type ModParams = BTreeMap<String, String>;

/// Opaque per-flow state owned by one module.
pub trait FlowData: Any + Send {
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
    /// Downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> FlowData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Outcome of processing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketVerdict {
    /// Keep accumulating
    Continue,
    /// Export this flow immediately (e.g. TCP close observed)
    ExportNow,
}

/// A per-flow timer a module wants fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSpec {
    /// Module-chosen timer id, echoed back on `timeout`
    pub id: u32,
    /// Firing interval in milliseconds
    pub interval_ms: u32,
    /// Re-arm after firing
    pub recurring: bool,
    /// Snap firings to wall-clock multiples of the interval
    pub aligned: bool,
}

/// A pluggable per-packet aggregator.
pub trait MetricModule: Send + Sync {
    /// Module name used in rule definitions.
    fn name(&self) -> &'static str;

    /// Output schema of `export_data`.
    fn schema(&self) -> &'static [TypeInfo];

    /// One-time setup when the module is first acquired.
    fn init_module(&self) -> MeterResult<()> {
        Ok(())
    }

    /// Teardown when the last reference is released.
    fn destroy_module(&self) {}

    /// Parse the rule's module parameters into fresh per-flow state.
    /// A failure aborts the rule install.
    fn init_flow_rec(&self, params: &ModParams) -> MeterResult<Box<dyn FlowData>>;

    /// Zero the accumulators for a new interval; key fields persist.
    fn reset_flow_rec(&self, state: &mut dyn FlowData);

    /// Update the flow state with one packet.
    fn process_packet(
        &self,
        pkt: &[u8],
        meta: &PacketMeta,
        state: &mut dyn FlowData,
    ) -> MeterResult<PacketVerdict>;

    /// Render the flow state against the schema.
    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter);

    /// Per-flow timers; empty means none.
    fn get_timers(&self, _state: &dyn FlowData) -> Vec<TimerSpec> {
        Vec::new()
    }

    /// Invoked when a module timer fires.
    fn timeout(&self, _timer_id: u32, _state: &mut dyn FlowData) {}
}

struct ModuleEntry {
    module: Arc<dyn MetricModule>,
    refs: u32,
}

/// Module table with reference counting.
///
/// `acquire` runs `init_module` on the zero-to-one transition, `release`
/// runs `destroy_module` on the one-to-zero transition. Implementations
/// register at construction (a compile-time inventory instead of shared
/// objects and symbol tables).
#[derive(Default)]
pub struct ModuleRegistry {
    mods: DashMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in modules installed.
    pub fn builtin() -> Self {
        let reg = Self::new();
        reg.register(Arc::new(crate::modules::count::CountModule));
        reg.register(Arc::new(crate::modules::pktlen::PktLenModule));
        reg.register(Arc::new(crate::modules::flowstats::FlowStatsModule));
        reg.register(Arc::new(crate::modules::jitter::JitterModule));
        reg.register(Arc::new(crate::modules::port_use::PortUseModule));
        reg.register(Arc::new(crate::modules::bandwidth::BandwidthModule));
        reg.register(Arc::new(crate::modules::rtploss::RtpLossModule));
        reg.register(Arc::new(crate::modules::rtt_ping::RttPingModule));
        reg.register(Arc::new(crate::modules::pktid_crc32::PktIdCrc32Module));
        reg.register(Arc::new(crate::modules::pktid_sha::PktIdShaModule));
        reg
    }

    /// Make a module available under its name.
    pub fn register(&self, module: Arc<dyn MetricModule>) {
        self.mods
            .insert(module.name().to_string(), ModuleEntry { module, refs: 0 });
    }

    /// Acquire a module reference.
    pub fn acquire(&self, name: &str) -> MeterResult<Arc<dyn MetricModule>> {
        let mut entry = self
            .mods
            .get_mut(name)
            .ok_or_else(|| MeterError::UnknownModule(name.to_string()))?;
        if entry.refs == 0 {
            entry.module.init_module()?;
            debug!(module = name, "module initialized");
        }
        entry.refs += 1;
        Ok(entry.module.clone())
    }

    /// Release a module reference.
    pub fn release(&self, name: &str) {
        if let Some(mut entry) = self.mods.get_mut(name) {
            debug_assert!(entry.refs > 0);
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entry.module.destroy_module();
                debug!(module = name, "module destroyed");
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

    /// Schema of a module, for the control channel.
    pub fn schema_of(&self, name: &str) -> MeterResult<&'static [TypeInfo]> {
        self.mods
            .get(name)
            .map(|e| e.module.schema())
            .ok_or_else(|| MeterError::UnknownModule(name.to_string()))
    }
}
