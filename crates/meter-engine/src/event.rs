//! Timed events driving the rule lifecycle.

use std::collections::BTreeSet;

use meter_common::IntervalSpec;
use meter_proc::TimerSpec;

/// What happens when a scheduled time arrives.
#[derive(Debug, Clone)]
pub enum Event {
    /// Activate scheduled rules (classifier, processor, exporter)
    ActivateRules(Vec<u32>),
    /// Deactivate rules: final export, removal everywhere
    RemoveRules(Vec<u32>),
    /// Interval export for rules sharing one interval and module set
    Export {
        /// Rules to export
        uids: Vec<u32>,
        /// The shared interval
        interval: IntervalSpec,
        /// Export modules this interval feeds (empty: all configured)
        modules: BTreeSet<String>,
    },
    /// Idle flow expiry check for one rule
    FlowTimeout {
        /// Rule uid
        uid: u32,
        /// Idle timeout in seconds
        timeout_s: u64,
    },
    /// A metric module's timer on one rule
    ProcModuleTimer {
        /// Rule uid
        uid: u32,
        /// Module name
        module: String,
        /// Timer descriptor
        timer: TimerSpec,
    },
    /// A process-wide export module timer
    ExportModuleTimer {
        /// Module name
        module: String,
        /// Timer descriptor
        timer: TimerSpec,
    },
    /// Stop the main loop
    Shutdown,
}

/// Outcome of removing one rule from an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTrim {
    /// The event does not reference the rule
    Untouched,
    /// The rule was removed, other rules remain
    Shrunk,
    /// The event is now empty and should be dropped
    Empty,
}

impl Event {
    /// Drop `uid` from the event.
    pub fn remove_rule(&mut self, uid: u32) -> EventTrim {
        let uids = match self {
            Event::ActivateRules(uids) | Event::RemoveRules(uids) => uids,
            Event::Export { uids, .. } => uids,
            Event::FlowTimeout { uid: u, .. } | Event::ProcModuleTimer { uid: u, .. } => {
                return if *u == uid {
                    EventTrim::Empty
                } else {
                    EventTrim::Untouched
                };
            }
            Event::ExportModuleTimer { .. } | Event::Shutdown => return EventTrim::Untouched,
        };
        let before = uids.len();
        uids.retain(|&u| u != uid);
        if uids.len() == before {
            EventTrim::Untouched
        } else if uids.is_empty() {
            EventTrim::Empty
        } else {
            EventTrim::Shrunk
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ActivateRules(_) => "activate_rules",
            Event::RemoveRules(_) => "remove_rules",
            Event::Export { .. } => "push_export",
            Event::FlowTimeout { .. } => "flow_timeout",
            Event::ProcModuleTimer { .. } => "proc_module_timer",
            Event::ExportModuleTimer { .. } => "export_module_timer",
            Event::Shutdown => "shutdown",
        }
    }
}
