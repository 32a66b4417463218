//! Exporter: per-rule export module instances and record delivery.

use std::collections::HashMap;
use std::sync::Arc;

use meter_common::{AtomicCounter, MeterResult, Rule};
use meter_proc::TimerSpec;
use tracing::{debug, warn};

use crate::module::{ExportModule, ExportRegistry, ExportState};
use crate::queue::QueuedRecord;

struct ExportSlot {
    module: Arc<dyn ExportModule>,
    name: String,
    state: Box<dyn ExportState>,
}

/// Exporter counters.
#[derive(Debug, Default)]
pub struct ExportStats {
    /// Records delivered to at least one sink
    pub exported: AtomicCounter,
    /// Sink errors (record discarded, module kept)
    pub errors: AtomicCounter,
}

/// Hands flow records to each rule's configured export modules.
pub struct Exporter {
    registry: Arc<ExportRegistry>,
    rules: HashMap<u32, Vec<ExportSlot>>,
    stats: ExportStats,
}

impl Exporter {
    /// Exporter drawing sinks from `registry`.
    pub fn new(registry: Arc<ExportRegistry>) -> Self {
        Self {
            registry,
            rules: HashMap::new(),
            stats: ExportStats::default(),
        }
    }

    /// The export module registry.
    pub fn registry(&self) -> &Arc<ExportRegistry> {
        &self.registry
    }

    /// Counters.
    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }

    /// Validate the export part of a rule set without side effects.
    pub fn check_rules(&self, rules: &[&Rule]) -> MeterResult<()> {
        for rule in rules {
            for e in &rule.exports {
                let (module, _) = self.registry.acquire(&e.name)?;
                let probe = module.init_export_rec(&e.params);
                self.registry.release(&e.name);
                probe?;
            }
        }
        Ok(())
    }

    /// Install a rule's export instances. Returns process-wide timers of
    /// modules acquired for the first time; the caller schedules them.
    pub fn add_rule(&mut self, rule: &Rule) -> MeterResult<Vec<(String, TimerSpec)>> {
        let mut slots = Vec::with_capacity(rule.exports.len());
        let mut timers = Vec::new();
        for e in &rule.exports {
            let res = self.registry.acquire(&e.name).and_then(|(module, first)| {
                let state = module.init_export_rec(&e.params)?;
                Ok((module, state, first))
            });
            match res {
                Ok((module, state, first)) => {
                    if first {
                        for t in module.add_timer_events() {
                            timers.push((e.name.clone(), t));
                        }
                    }
                    slots.push(ExportSlot {
                        module,
                        name: e.name.clone(),
                        state,
                    });
                }
                Err(err) => {
                    for slot in &slots {
                        self.registry.release(&slot.name);
                    }
                    return Err(err);
                }
            }
        }
        debug!(uid = rule.uid, "exporter instances installed");
        self.rules.insert(rule.uid, slots);
        Ok(timers)
    }

    /// Remove a rule's export instances.
    pub fn del_rule(&mut self, uid: u32) {
        if let Some(slots) = self.rules.remove(&uid) {
            for slot in &slots {
                self.registry.release(&slot.name);
            }
            debug!(uid, "exporter instances removed");
        }
    }

    /// Deliver one queued record to the selected export modules.
    pub fn export(&mut self, rec: QueuedRecord) {
        let Some(slots) = self.rules.get_mut(&rec.rule_id) else {
            warn!(rule = rec.rule_id, "record for unknown rule discarded");
            return;
        };
        let mut delivered = false;
        for slot in slots.iter_mut() {
            if !rec.modules.is_empty() && !rec.modules.contains(&slot.name) {
                continue;
            }
            match slot.module.export_data(&rec.record, &mut *slot.state) {
                Ok(()) => delivered = true,
                Err(e) => {
                    // transient sink faults must not tear the rule down
                    self.stats.errors.inc();
                    warn!(
                        rule = rec.rule_id,
                        module = %slot.name,
                        error = %e,
                        "export sink failed, record discarded"
                    );
                }
            }
        }
        if delivered {
            self.stats.exported.inc();
        }
    }

    /// Fan a module timer out to its module.
    pub fn module_timeout(&self, module: &str, timer_id: u32) {
        if let Ok((m, _)) = self.registry.acquire(module) {
            m.timeout(timer_id);
            self.registry.release(module);
        }
    }

    /// Installed rule count.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
