//! Rule database and lifecycle bookkeeping.
//!
//! Owns all installed rules. Components hold read-only views keyed by the
//! dense uid this manager assigns; removed rules move to a bounded done
//! list and their uid returns to the id source.

use std::collections::HashMap;

use meter_common::{MeterError, MeterResult, Rule, RuleIdSource, RuleState, UsecTs};
use tracing::{debug, info};

/// Removed rules kept for the control channel's history
const DONE_KEEP: usize = 64;

/// Rule store with set/name indexing and dense uid allocation.
#[derive(Default)]
pub struct RuleManager {
    ids: RuleIdSource,
    rules: HashMap<u32, Rule>,
    /// set name -> rule name -> uid
    index: HashMap<String, HashMap<String, u32>>,
    done: Vec<Rule>,
}

impl RuleManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a parsed rule, resolve its times against `now`, assign a
    /// uid and store it in `Valid` state.
    pub fn install(&mut self, mut rule: Rule, now: UsecTs) -> MeterResult<u32> {
        rule.validate()?;
        rule.resolve_times(now)?;

        if let Some(set) = self.index.get(&rule.set_name) {
            if set.contains_key(&rule.rule_name) {
                return Err(MeterError::InvalidRule {
                    rule: rule.ident(),
                    reason: "a rule with this name is already installed".into(),
                });
            }
        }

        let uid = self.ids.alloc();
        rule.uid = uid;
        rule.state = RuleState::Valid;
        info!(uid, ident = %rule.ident(), start = rule.start, stop = ?rule.stop, "rule installed");
        self.index
            .entry(rule.set_name.clone())
            .or_default()
            .insert(rule.rule_name.clone(), uid);
        self.rules.insert(uid, rule);
        Ok(uid)
    }

    /// Roll a failed install back without leaving a trace.
    pub fn rollback(&mut self, uid: u32) {
        if let Some(rule) = self.rules.remove(&uid) {
            if let Some(set) = self.index.get_mut(&rule.set_name) {
                set.remove(&rule.rule_name);
                if set.is_empty() {
                    self.index.remove(&rule.set_name);
                }
            }
            self.ids.free(uid);
            debug!(uid, "rule install rolled back");
        }
    }

    /// Set a rule's lifecycle state.
    pub fn set_state(&mut self, uid: u32, state: RuleState) {
        if let Some(rule) = self.rules.get_mut(&uid) {
            rule.state = state;
        }
    }

    /// Remove a rule, recycling its uid. The rule moves to the done list.
    pub fn remove(&mut self, uid: u32) -> Option<Rule> {
        let mut rule = self.rules.remove(&uid)?;
        if let Some(set) = self.index.get_mut(&rule.set_name) {
            set.remove(&rule.rule_name);
            if set.is_empty() {
                self.index.remove(&rule.set_name);
            }
        }
        self.ids.free(uid);
        rule.state = RuleState::Done;
        info!(uid, ident = %rule.ident(), "rule removed");
        self.done.push(rule.clone());
        if self.done.len() > DONE_KEEP {
            self.done.remove(0);
        }
        Some(rule)
    }

    /// Rule by uid.
    pub fn get(&self, uid: u32) -> Option<&Rule> {
        self.rules.get(&uid)
    }

    /// Uid of `set.name`.
    pub fn lookup(&self, set: &str, name: &str) -> Option<u32> {
        self.index.get(set)?.get(name).copied()
    }

    /// All uids of one set.
    pub fn uids_of_set(&self, set: &str) -> Vec<u32> {
        self.index
            .get(set)
            .map(|m| {
                let mut v: Vec<u32> = m.values().copied().collect();
                v.sort_unstable();
                v
            })
            .unwrap_or_default()
    }

    /// Uids of all rules in a given state.
    pub fn uids_in_state(&self, state: RuleState) -> Vec<u32> {
        let mut v: Vec<u32> = self
            .rules
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.uid)
            .collect();
        v.sort_unstable();
        v
    }

    /// Installed rule count.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when no rules are installed.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// `set.name` identifiers of all installed rules, sorted.
    pub fn idents(&self) -> Vec<String> {
        let mut v: Vec<String> = self.rules.values().map(|r| r.ident()).collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_common::{Filter, FlowTimeout, MatchKind, ModuleSpec, RefPoint};

    fn rule(set: &str, name: &str) -> Rule {
        Rule {
            uid: 0,
            set_name: set.into(),
            rule_name: name.into(),
            state: RuleState::New,
            start: 0,
            stop: None,
            duration_s: None,
            bidir: false,
            sep_paths: false,
            auto_flows: false,
            flow_timeout: FlowTimeout::Off,
            interval: None,
            filters: vec![Filter {
                name: "proto".into(),
                refer: RefPoint::Ip,
                offs: 9,
                len: 1,
                mask: vec![0xff],
                def_mask: vec![0xff],
                kind: MatchKind::Exact,
                values: vec![vec![17]],
                reverse: None,
            }],
            actions: vec![ModuleSpec::new("count")],
            exports: vec![ModuleSpec::new("text")],
        }
    }

    #[test]
    fn test_install_assigns_dense_uids() {
        let mut m = RuleManager::new();
        let a = m.install(rule("s", "a"), 1_000_000).unwrap();
        let b = m.install(rule("s", "b"), 1_000_000).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(m.lookup("s", "a"), Some(0));
        m.remove(a);
        let c = m.install(rule("s", "c"), 1_000_000).unwrap();
        assert_eq!(c, 0, "uid recycled");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut m = RuleManager::new();
        m.install(rule("s", "a"), 0).unwrap();
        assert!(m.install(rule("s", "a"), 0).is_err());
        assert!(m.install(rule("other", "a"), 0).is_ok());
    }

    #[test]
    fn test_rollback_leaves_nothing() {
        let mut m = RuleManager::new();
        let uid = m.install(rule("s", "a"), 0).unwrap();
        m.rollback(uid);
        assert!(m.is_empty());
        assert_eq!(m.lookup("s", "a"), None);
        assert_eq!(m.install(rule("s", "b"), 0).unwrap(), uid);
    }

    #[test]
    fn test_uids_of_set() {
        let mut m = RuleManager::new();
        m.install(rule("s", "a"), 0).unwrap();
        m.install(rule("s", "b"), 0).unwrap();
        m.install(rule("t", "c"), 0).unwrap();
        assert_eq!(m.uids_of_set("s"), vec![0, 1]);
        assert_eq!(m.uids_of_set("missing"), Vec::<u32>::new());
    }
}
