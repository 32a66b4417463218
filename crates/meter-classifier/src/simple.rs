//! Linear classifier.
//!
//! Walks every installed slot per packet and evaluates the filters
//! directly against the packet bytes. Slow but complete; accepts every
//! filter shape and serves as the correctness oracle for the RFC engine.

use std::collections::BTreeMap;

use meter_common::{MatchKind, MeterResult, PacketMeta, Rule, MAX_FILTER_LEN};
use tracing::warn;

use crate::{fwd_slot, rev_slot, Classifier, ClassifierStats, MAX_RULES};

/// One compiled filter predicate of a slot.
#[derive(Debug, Clone)]
struct CompiledMatch {
    /// Layer offset array index
    layer: usize,
    offs: u16,
    len: u16,
    /// Filter mask joined with the definition mask
    mask: Vec<u8>,
    kind: MatchKind,
    /// Match values, pre-masked
    values: Vec<Vec<u8>>,
}

impl CompiledMatch {
    fn from_filter(f: &meter_common::Filter, reverse: bool) -> Self {
        let (refer, offs) = if reverse {
            // compile against the reverse anchor where one exists
            match f.reverse {
                Some(r) => (r.refer, r.offs),
                None => (f.refer, f.offs),
            }
        } else {
            (f.refer, f.offs)
        };
        let mask = f.joined_mask();
        let values = f
            .values
            .iter()
            .map(|v| v.iter().zip(mask.iter()).map(|(b, m)| b & m).collect())
            .collect();
        Self {
            layer: refer.layer() as usize,
            offs,
            len: f.len,
            mask,
            kind: f.kind,
            values,
        }
    }

    /// Evaluate against a packet. A missing layer or a window beyond the
    /// captured bytes is a miss.
    #[inline]
    fn matches(&self, meta: &PacketMeta, payload: &[u8]) -> bool {
        let base = meta.offs[self.layer];
        if base < 0 {
            return false;
        }
        let start = base as usize + self.offs as usize;
        let end = start + self.len as usize;
        if end > payload.len() {
            return false;
        }
        if self.kind == MatchKind::Wild {
            return true;
        }

        let mut buf = [0u8; MAX_FILTER_LEN];
        let window = &mut buf[..self.len as usize];
        for (i, b) in payload[start..end].iter().enumerate() {
            window[i] = b & self.mask[i];
        }
        let window: &[u8] = window;

        match self.kind {
            MatchKind::Wild => true,
            MatchKind::Exact => window == self.values[0].as_slice(),
            // network byte order makes lexicographic compare numeric
            MatchKind::Range => {
                window >= self.values[0].as_slice() && window <= self.values[1].as_slice()
            }
            MatchKind::Set => self.values.iter().any(|v| window == v.as_slice()),
        }
    }
}

/// Linear matcher over all installed slots.
#[derive(Default)]
pub struct SimpleClassifier {
    /// Compiled filters per slot, iterated in ascending slot order
    slots: BTreeMap<usize, Vec<CompiledMatch>>,
    stats: ClassifierStats,
}

impl SimpleClassifier {
    /// New empty classifier.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_slot(&mut self, rule: &Rule, reverse: bool) {
        let slot = if reverse {
            rev_slot(rule.uid)
        } else {
            fwd_slot(rule.uid)
        };
        let compiled = rule
            .filters
            .iter()
            .map(|f| CompiledMatch::from_filter(f, reverse))
            .collect();
        self.slots.insert(slot, compiled);
        self.stats.rules.inc();
    }
}

impl Classifier for SimpleClassifier {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn check_rules(&self, rules: &[&Rule]) -> MeterResult<()> {
        // the linear matcher accepts every filter shape; only the slot
        // space is bounded
        for r in rules {
            if rev_slot(r.uid) >= MAX_RULES {
                return Err(meter_common::MeterError::ClassifierCapacity(format!(
                    "rule id {} exceeds {} slots",
                    r.uid, MAX_RULES
                )));
            }
        }
        Ok(())
    }

    fn add_rules(&mut self, rules: &[&Rule]) -> MeterResult<()> {
        self.check_rules(rules)?;
        for r in rules {
            self.add_slot(r, false);
            // a reverse entry only exists when some filter swaps direction
            if r.bidir && r.has_reverse_path() {
                self.add_slot(r, true);
            }
        }
        Ok(())
    }

    fn del_rules(&mut self, rules: &[&Rule]) {
        for r in rules {
            if self.slots.remove(&fwd_slot(r.uid)).is_some() {
                self.stats.rules.dec();
            }
            if self.slots.remove(&rev_slot(r.uid)).is_some() {
                self.stats.rules.dec();
            }
        }
    }

    fn classify(&mut self, meta: &mut PacketMeta, payload: &[u8]) -> usize {
        meta.clear_matches();
        self.stats.packets.inc();

        let mut last_id = u32::MAX;
        for (&slot, matches) in &self.slots {
            if !matches.iter().all(|m| m.matches(meta, payload)) {
                continue;
            }
            let rid = (slot >> 1) as u32;
            // forward and reverse entries of one rule dedup to one match
            if rid == last_id {
                continue;
            }
            if !meta.push_match(rid) {
                warn!(rid, "match list full, truncating");
                break;
            }
            if slot & 1 == 1 {
                meta.reverse = true;
            }
            last_id = rid;
        }

        self.stats.matches.add(meta.match_cnt as u64);
        meta.match_cnt as usize
    }

    fn stats(&self) -> &ClassifierStats {
        &self.stats
    }
}
