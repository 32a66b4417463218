//! Rule and filter data model.
//!
//! Rules arrive already parsed (the rule-file and filter-definition parsers
//! are external collaborators); this module carries the validated structures
//! the core operates on.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{MeterError, MeterResult};
use crate::meta::PktLayer;
use crate::time::{UsecTs, USECS_PER_SEC};

/// Max byte length of one filter window (fits an IPv6 address twice over)
pub const MAX_FILTER_LEN: usize = 32;

/// Max number of values in a set filter
pub const MAX_FILTER_SET_SIZE: usize = 16;

/// Idle timeout applied when a rule enables flow timeout without a value
pub const DEFAULT_FLOW_TIMEOUT_S: u64 = 30;

/// Header anchor a filter offset is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefPoint {
    /// Link header
    Mac,
    /// Network header
    Ip,
    /// Transport header
    Trans,
    /// Payload
    Data,
}

impl RefPoint {
    /// The packet-meta layer this anchor maps to.
    #[inline(always)]
    pub fn layer(self) -> PktLayer {
        match self {
            RefPoint::Mac => PktLayer::Link,
            RefPoint::Ip => PktLayer::Net,
            RefPoint::Trans => PktLayer::Trans,
            RefPoint::Data => PktLayer::Data,
        }
    }
}

/// Predicate shape of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Byte equality against a single value
    Exact,
    /// Inclusive range between two values, network byte order
    Range,
    /// Equality against any value of a small set
    Set,
    /// Always matches
    Wild,
}

/// Reverse-path anchor for bidirectional rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReversePath {
    /// Reference point on the reverse path
    pub refer: RefPoint,
    /// Byte offset within that reference point
    pub offs: u16,
}

/// One masked predicate over a packet header region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    /// Symbolic attribute name (e.g. "SrcIP")
    pub name: String,
    /// Reference point of the match window
    pub refer: RefPoint,
    /// Byte offset within the reference point
    pub offs: u16,
    /// Window length in bytes
    pub len: u16,
    /// Filter mask, `len` bytes
    pub mask: Vec<u8>,
    /// Definition mask from the filter attribute definition, `len` bytes;
    /// joined with `mask` when the classifier compiles the rule
    pub def_mask: Vec<u8>,
    /// Predicate shape
    pub kind: MatchKind,
    /// Match values in network byte order (1 for exact, 2 for range,
    /// 1..=MAX_FILTER_SET_SIZE for set, 0 for wildcard)
    pub values: Vec<Vec<u8>>,
    /// Reverse-path anchor; present on attributes that swap direction
    #[serde(default)]
    pub reverse: Option<ReversePath>,
}

impl Filter {
    /// Effective mask: filter mask AND definition mask.
    pub fn joined_mask(&self) -> Vec<u8> {
        self.mask
            .iter()
            .zip(self.def_mask.iter())
            .map(|(a, b)| a & b)
            .collect()
    }

    /// Structural validation of lengths, masks and value counts.
    pub fn validate(&self) -> MeterResult<()> {
        let err = |reason: &str| {
            Err(MeterError::InvalidFilter(
                self.name.clone(),
                reason.to_string(),
            ))
        };
        if self.len == 0 || self.len as usize > MAX_FILTER_LEN {
            return err("window length out of range");
        }
        if self.mask.len() != self.len as usize || self.def_mask.len() != self.len as usize {
            return err("mask length does not match window length");
        }
        let want = match self.kind {
            MatchKind::Exact => 1..=1,
            MatchKind::Range => 2..=2,
            MatchKind::Set => 1..=MAX_FILTER_SET_SIZE,
            MatchKind::Wild => 0..=0,
        };
        if !want.contains(&self.values.len()) {
            return err("wrong number of match values for match kind");
        }
        if self.values.iter().any(|v| v.len() != self.len as usize) {
            return err("match value length does not match window length");
        }
        if self.kind == MatchKind::Range && self.values[0] > self.values[1] {
            return err("range start exceeds range end");
        }
        Ok(())
    }
}

/// A metric or export module selection with its parameter bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Module name
    pub name: String,
    /// Module parameters, passed through to the module verbatim
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ModuleSpec {
    /// Convenience constructor for tests and builders.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Set a parameter, builder style.
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// Export interval with optional wall-clock alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntervalSpec {
    /// Interval in seconds
    pub interval_s: u64,
    /// Snap export times to wall-clock multiples of the interval
    pub align: bool,
}

impl IntervalSpec {
    /// Interval in microseconds.
    #[inline]
    pub fn interval_us(&self) -> u64 {
        self.interval_s * USECS_PER_SEC
    }
}

/// Idle timeout configuration for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowTimeout {
    /// No idle expiry
    Off,
    /// Expire idle flows after the default timeout
    Default,
    /// Expire idle flows after the given number of seconds
    Secs(u64),
}

impl Default for FlowTimeout {
    fn default() -> Self {
        FlowTimeout::Off
    }
}

impl FlowTimeout {
    /// Effective timeout in seconds, or None when disabled.
    pub fn secs(&self) -> Option<u64> {
        match self {
            FlowTimeout::Off => None,
            FlowTimeout::Default => Some(DEFAULT_FLOW_TIMEOUT_S),
            FlowTimeout::Secs(0) => None,
            FlowTimeout::Secs(s) => Some(*s),
        }
    }
}

/// Lifecycle states of a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    /// Just parsed
    New,
    /// Passed validation by all components
    Valid,
    /// Activation event queued
    Scheduled,
    /// Observable to the classifier
    Active,
    /// Deactivated and drained
    Done,
    /// Failed validation
    Error,
}

/// A measurement task: a conjunction of filters plus the metric modules to
/// run on matching packets and the export modules to deliver results to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Dense unique id, assigned on install
    #[serde(default)]
    pub uid: u32,
    /// Rule set this rule belongs to
    pub set_name: String,
    /// Rule name within the set
    pub rule_name: String,
    /// Lifecycle state
    #[serde(default = "default_state")]
    pub state: RuleState,
    /// Activation time, epoch µs; 0 means "now"
    #[serde(default)]
    pub start: UsecTs,
    /// Deactivation time, epoch µs; None means open-ended
    #[serde(default)]
    pub stop: Option<UsecTs>,
    /// Lifetime in seconds; combined with start/stop on install
    #[serde(default)]
    pub duration_s: Option<u64>,
    /// Match both directions of a flow
    #[serde(default)]
    pub bidir: bool,
    /// Keep separate flow records per direction (bidir rules only)
    #[serde(default)]
    pub sep_paths: bool,
    /// One flow record per distinct flow key instead of one aggregate
    #[serde(default)]
    pub auto_flows: bool,
    /// Idle flow expiry
    #[serde(default)]
    pub flow_timeout: FlowTimeout,
    /// Rule-wide export interval applied to export modules without their own
    #[serde(default)]
    pub interval: Option<IntervalSpec>,
    /// Filters, in declaration order (the order defines the flow key)
    pub filters: Vec<Filter>,
    /// Metric modules to invoke per matching packet, in order
    pub actions: Vec<ModuleSpec>,
    /// Export modules to deliver records to, in order
    pub exports: Vec<ModuleSpec>,
}

fn default_state() -> RuleState {
    RuleState::New
}

impl Rule {
    /// `set.name` identifier.
    pub fn ident(&self) -> String {
        format!("{}.{}", self.set_name, self.rule_name)
    }

    /// Structural validation; does not touch any component state.
    pub fn validate(&self) -> MeterResult<()> {
        let err = |reason: &str| {
            Err(MeterError::InvalidRule {
                rule: self.ident(),
                reason: reason.to_string(),
            })
        };
        if self.rule_name.is_empty() {
            return err("missing rule identifier");
        }
        if self.filters.is_empty() {
            return err("no filters specified");
        }
        if self.actions.is_empty() {
            return err("no actions specified");
        }
        if self.exports.is_empty() {
            return err("no exports specified");
        }
        if self.sep_paths && !self.bidir {
            return err("sep_paths requires bidir");
        }
        for f in &self.filters {
            f.validate()?;
        }
        if let Some(stop) = self.stop {
            if self.start > stop && self.duration_s.is_none() {
                return err("start time after stop time");
            }
        }
        Ok(())
    }

    /// Resolve start/stop/duration against the current time.
    ///
    /// At most two of the three may be given. A stop time in the past is an
    /// error; a start time in the past is clamped to now.
    pub fn resolve_times(&mut self, now: UsecTs) -> MeterResult<()> {
        let err = |rule: &Rule, reason: &str| {
            Err(MeterError::InvalidRule {
                rule: rule.ident(),
                reason: reason.to_string(),
            })
        };
        if self.start != 0 && self.stop.is_some() && self.duration_s.is_some() {
            return err(self, "illegal to specify start+stop+duration");
        }
        if self.start == 0 {
            self.start = now;
        }
        if let Some(dur) = self.duration_s.take() {
            let dur_us = dur * USECS_PER_SEC;
            match self.stop {
                // stop + duration given: derive the start
                Some(stop) => self.start = stop.saturating_sub(dur_us),
                // start [+ duration] given: derive the stop
                None => self.stop = Some(self.start + dur_us),
            }
        }
        if let Some(stop) = self.stop {
            if stop <= now {
                return err(self, "task running time is already over");
            }
        }
        if self.start < now {
            self.start = now;
        }
        Ok(())
    }

    /// True when any filter carries a reverse-path anchor; a bidir rule
    /// without one has no reverse entry in the classifier.
    pub fn has_reverse_path(&self) -> bool {
        self.filters.iter().any(|f| f.reverse.is_some())
    }

    /// Group export modules by their effective interval.
    ///
    /// A module-level `interval` parameter wins over the rule-wide one;
    /// modules without any interval do not appear (they only see the final
    /// export).
    pub fn intervals(&self) -> BTreeMap<IntervalSpec, BTreeSet<String>> {
        let mut out: BTreeMap<IntervalSpec, BTreeSet<String>> = BTreeMap::new();
        for e in &self.exports {
            let own = e
                .params
                .get("interval")
                .and_then(|v| v.parse::<u64>().ok())
                .map(|interval_s| IntervalSpec {
                    interval_s,
                    align: e.params.contains_key("align")
                        || self.interval.map(|i| i.align).unwrap_or(false),
                });
            let spec = own.or(self.interval);
            if let Some(spec) = spec {
                if spec.interval_s > 0 {
                    out.entry(spec).or_default().insert(e.name.clone());
                }
            }
        }
        out
    }
}
