//! Packet processor.
//!
//! Consults each classified packet's match set, locates (or creates) the
//! flow record for the packet's flow key and runs the rule's metric module
//! chain over it. Owns all per-rule module state and the flow tables.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use meter_common::{
    AtomicCounter, MeterError, MeterResult, PacketMeta, Rule, UsecTs, USECS_PER_SEC,
};
use tracing::{debug, error, warn};

use crate::module::{MetricModule, ModParams, ModuleRegistry, PacketVerdict};
use crate::record::{FlowDataBlock, FlowRecord, MetricData};
use crate::wire::RecordWriter;

/// One filter-derived component of the flow key.
#[derive(Debug, Clone)]
struct KeyField {
    /// (layer index, offset) on the forward path
    fwd: (usize, u16),
    /// (layer index, offset) on the reverse path
    rev: (usize, u16),
    len: u16,
    /// Definition mask; non-key bits are cleared
    mask: Vec<u8>,
}

/// One metric module configured on a rule.
struct ModuleSlot {
    module: Arc<dyn MetricModule>,
    name: String,
    params: ModParams,
}

/// Per-flow state across the rule's module chain.
struct FlowEntry {
    flow_id: u64,
    new_flow: bool,
    last_ts: UsecTs,
    states: Vec<Box<dyn crate::module::FlowData>>,
}

/// Everything the processor keeps per installed rule.
struct RuleTask {
    uid: u32,
    ident: String,
    sep_paths: bool,
    auto_flows: bool,
    key_fields: Vec<KeyField>,
    modules: Vec<ModuleSlot>,
    flows: HashMap<Bytes, FlowEntry>,
    next_flow_id: u64,
    /// Timestamp of the rule's most recent packet
    last_pkt: UsecTs,
}

impl RuleTask {
    fn flow_key(&self, meta: &PacketMeta, payload: &[u8]) -> Bytes {
        let mut key = Vec::new();
        if self.auto_flows {
            for f in &self.key_fields {
                // reverse packets read through the reverse anchors so both
                // directions land on the same flow
                let (layer, offs) = if meta.reverse { f.rev } else { f.fwd };
                let start = key.len();
                key.resize(start + f.len as usize, 0);
                let base = meta.offs[layer];
                if base >= 0 {
                    let from = base as usize + offs as usize;
                    let to = from + f.len as usize;
                    if to <= payload.len() {
                        for (i, b) in payload[from..to].iter().enumerate() {
                            key[start + i] = b & f.mask[i];
                        }
                    }
                }
            }
        }
        if self.sep_paths {
            key.push(meta.reverse as u8);
        }
        Bytes::from(key)
    }

    fn new_entry(&mut self, now: UsecTs) -> MeterResult<FlowEntry> {
        let mut states = Vec::with_capacity(self.modules.len());
        for m in &self.modules {
            states.push(m.module.init_flow_rec(&m.params)?);
        }
        let id = self.next_flow_id;
        self.next_flow_id += 1;
        Ok(FlowEntry {
            flow_id: id,
            new_flow: true,
            last_ts: now,
            states,
        })
    }

    /// Snapshot the selected flows into a record and reset their
    /// accumulators.
    fn snapshot<F: Fn(&FlowEntry) -> bool>(
        &mut self,
        ts: UsecTs,
        final_rec: bool,
        select: F,
    ) -> FlowRecord {
        let mut metrics = Vec::with_capacity(self.modules.len());
        for (mi, m) in self.modules.iter().enumerate() {
            let mut blocks = Vec::new();
            let mut keys: Vec<&Bytes> = self
                .flows
                .iter()
                .filter(|(_, e)| select(e))
                .map(|(k, _)| k)
                .collect();
            keys.sort();
            let keys: Vec<Bytes> = keys.into_iter().cloned().collect();
            for k in keys {
                let e = self.flows.get_mut(&k).expect("selected flow");
                let mut w = RecordWriter::new();
                m.module.export_data(&*e.states[mi], &mut w);
                blocks.push(FlowDataBlock {
                    flow_id: e.flow_id,
                    new_flow: e.new_flow,
                    key: k.clone(),
                    data: w.finish(),
                });
            }
            metrics.push(MetricData {
                module: m.name.clone(),
                flows: blocks,
            });
        }
        // reset after all modules exported, then consume the new flag
        for e in self.flows.values_mut().filter(|e| select(e)) {
            for (mi, m) in self.modules.iter().enumerate() {
                m.module.reset_flow_rec(&mut *e.states[mi]);
            }
            e.new_flow = false;
        }
        FlowRecord {
            rule_id: self.uid,
            rule_name: self.ident.clone(),
            ts,
            final_rec,
            metrics,
        }
    }
}

/// Processor-wide counters.
#[derive(Debug, Default)]
pub struct ProcStats {
    /// Packets run through module chains
    pub packets: AtomicCounter,
    /// Records produced
    pub records: AtomicCounter,
    /// Module errors logged
    pub module_errors: AtomicCounter,
}

/// Hosts the per-rule metric module chains and flow tables.
pub struct PacketProcessor {
    registry: Arc<ModuleRegistry>,
    tasks: HashMap<u32, RuleTask>,
    stats: ProcStats,
}

impl PacketProcessor {
    /// Processor drawing modules from `registry`.
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            tasks: HashMap::new(),
            stats: ProcStats::default(),
        }
    }

    /// The module registry (shared with the control channel).
    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Counters.
    pub fn stats(&self) -> &ProcStats {
        &self.stats
    }

    /// Validate the action part of a rule set without side effects:
    /// modules must exist and accept their parameters.
    pub fn check_rules(&self, rules: &[&Rule]) -> MeterResult<()> {
        for rule in rules {
            for action in &rule.actions {
                let module = self.registry.acquire(&action.name)?;
                let probe = module.init_flow_rec(&action.params);
                self.registry.release(&action.name);
                probe.map_err(|e| MeterError::ModuleParams {
                    module: action.name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Install rules. All-or-nothing per rule.
    pub fn add_rules(&mut self, rules: &[&Rule]) -> MeterResult<()> {
        for rule in rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    fn add_rule(&mut self, rule: &Rule) -> MeterResult<()> {
        let mut modules = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            match self.registry.acquire(&action.name) {
                Ok(module) => modules.push(ModuleSlot {
                    module,
                    name: action.name.clone(),
                    params: action.params.clone(),
                }),
                Err(e) => {
                    for slot in &modules {
                        self.registry.release(&slot.name);
                    }
                    return Err(e);
                }
            }
        }

        let key_fields = rule
            .filters
            .iter()
            .map(|f| {
                let fwd = (f.refer.layer() as usize, f.offs);
                let rev = f
                    .reverse
                    .map(|r| (r.refer.layer() as usize, r.offs))
                    .unwrap_or(fwd);
                KeyField {
                    fwd,
                    rev,
                    len: f.len,
                    mask: f.def_mask.clone(),
                }
            })
            .collect();

        debug!(uid = rule.uid, ident = %rule.ident(), "processor task installed");
        self.tasks.insert(
            rule.uid,
            RuleTask {
                uid: rule.uid,
                ident: rule.ident(),
                sep_paths: rule.bidir && rule.sep_paths,
                auto_flows: rule.auto_flows,
                key_fields,
                modules,
                flows: HashMap::new(),
                next_flow_id: 0,
                last_pkt: 0,
            },
        );
        Ok(())
    }

    /// Remove a rule, releasing its modules. The caller is responsible for
    /// triggering the final export first.
    pub fn del_rule(&mut self, uid: u32) {
        if let Some(task) = self.tasks.remove(&uid) {
            for slot in &task.modules {
                self.registry.release(&slot.name);
            }
            debug!(uid, "processor task removed");
        }
    }

    /// Installed task count.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Live flow count of one rule.
    pub fn flow_count(&self, uid: u32) -> usize {
        self.tasks.get(&uid).map(|t| t.flows.len()).unwrap_or(0)
    }

    /// Timestamp of a rule's most recent packet.
    pub fn last_packet(&self, uid: u32) -> Option<UsecTs> {
        self.tasks.get(&uid).map(|t| t.last_pkt)
    }

    /// Run a classified packet through the module chains of every matched
    /// rule. Returns immediate-export records requested by modules.
    pub fn process(&mut self, meta: &PacketMeta, payload: &[u8]) -> Vec<FlowRecord> {
        self.stats.packets.inc();
        let mut immediate = Vec::new();

        for &rid in meta.match_ids() {
            let Some(task) = self.tasks.get_mut(&rid) else {
                // the classifier can be a step ahead of rule removal
                continue;
            };
            task.last_pkt = meta.ts;
            let key = task.flow_key(meta, payload);

            if !task.flows.contains_key(&key) {
                match task.new_entry(meta.ts) {
                    Ok(entry) => {
                        task.flows.insert(key.clone(), entry);
                    }
                    Err(e) => {
                        error!(uid = rid, error = %e, "flow record allocation failed");
                        continue;
                    }
                }
            }
            let entry = task.flows.get_mut(&key).expect("just inserted");
            entry.last_ts = meta.ts;

            let mut export_now = false;
            for (mi, slot) in task.modules.iter().enumerate() {
                match slot.module.process_packet(payload, meta, &mut *entry.states[mi]) {
                    Ok(PacketVerdict::Continue) => {}
                    Ok(PacketVerdict::ExportNow) => export_now = true,
                    Err(e) => {
                        // the packet still runs through the rest of the chain
                        self.stats.module_errors.inc();
                        warn!(
                            uid = rid,
                            module = %slot.name,
                            error = %e,
                            "metric module failed on packet"
                        );
                    }
                }
            }

            if export_now {
                // one record per export event, however many modules asked
                let ts = meta.ts;
                let flow_id = entry.flow_id;
                let rec = task.snapshot(ts, true, |e| e.flow_id == flow_id);
                self.stats.records.inc();
                immediate.push(rec);
            }
        }
        immediate
    }

    /// Timer descriptors of a rule's modules, probed against fresh flow
    /// state at install time.
    pub fn module_timers(&self, uid: u32) -> Vec<(String, crate::module::TimerSpec)> {
        let Some(task) = self.tasks.get(&uid) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for slot in &task.modules {
            if let Ok(state) = slot.module.init_flow_rec(&slot.params) {
                for t in slot.module.get_timers(&*state) {
                    out.push((slot.name.clone(), t));
                }
            }
        }
        out
    }

    /// Fire a module timer across every flow of a rule.
    pub fn module_timeout(&mut self, uid: u32, module: &str, timer_id: u32) {
        let Some(task) = self.tasks.get_mut(&uid) else {
            return;
        };
        for (mi, slot) in task.modules.iter().enumerate() {
            if slot.name != module {
                continue;
            }
            for entry in task.flows.values_mut() {
                slot.module.timeout(timer_id, &mut *entry.states[mi]);
            }
        }
    }

    /// Interval or final export of every flow of a rule.
    pub fn export_rule(&mut self, uid: u32, now: UsecTs, final_rec: bool) -> Option<FlowRecord> {
        let task = self.tasks.get_mut(&uid)?;
        let rec = task.snapshot(now, final_rec, |_| true);
        self.stats.records.inc();
        Some(rec)
    }

    /// Expire flows idle for `timeout_s` seconds.
    ///
    /// Returns the final record covering the expired flows (if any) and
    /// the time at which the next flow could expire.
    pub fn check_idle(
        &mut self,
        uid: u32,
        timeout_s: u64,
        now: UsecTs,
    ) -> (Option<FlowRecord>, Option<UsecTs>) {
        let timeout_us = timeout_s * USECS_PER_SEC;
        let Some(task) = self.tasks.get_mut(&uid) else {
            return (None, None);
        };

        let expired: Vec<Bytes> = task
            .flows
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_ts) >= timeout_us)
            .map(|(k, _)| k.clone())
            .collect();

        let record = if expired.is_empty() {
            None
        } else {
            let rec = task.snapshot(now, true, |e| {
                now.saturating_sub(e.last_ts) >= timeout_us
            });
            // idle timeout deletes the flow after its final export
            for k in &expired {
                task.flows.remove(k);
            }
            self.stats.records.inc();
            Some(rec)
        };

        let next = task
            .flows
            .values()
            .map(|e| e.last_ts + timeout_us)
            .min();
        (record, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};
    use meter_common::{
        Filter, FlowTimeout, MatchKind, ModuleSpec, RefPoint, ReversePath, RuleState,
    };

    fn proto_filter() -> Filter {
        Filter {
            name: "proto".into(),
            refer: RefPoint::Ip,
            offs: 9,
            len: 1,
            mask: vec![0xff],
            def_mask: vec![0xff],
            kind: MatchKind::Exact,
            values: vec![vec![17]],
            reverse: None,
        }
    }

    fn src_ip_filter() -> Filter {
        Filter {
            name: "srcip".into(),
            refer: RefPoint::Ip,
            offs: 12,
            len: 4,
            mask: vec![0xff; 4],
            def_mask: vec![0xff; 4],
            kind: MatchKind::Wild,
            values: vec![],
            reverse: Some(ReversePath {
                refer: RefPoint::Ip,
                offs: 16,
            }),
        }
    }

    fn rule(uid: u32, actions: Vec<ModuleSpec>) -> Rule {
        Rule {
            uid,
            set_name: "t".into(),
            rule_name: format!("r{uid}"),
            state: RuleState::New,
            start: 0,
            stop: None,
            duration_s: None,
            bidir: false,
            sep_paths: false,
            auto_flows: false,
            flow_timeout: FlowTimeout::Off,
            interval: None,
            filters: vec![proto_filter()],
            actions,
            exports: vec![ModuleSpec::new("text")],
        }
    }

    fn udp_meta(ts: UsecTs, len: u32, matched: &[u32]) -> (PacketMeta, Vec<u8>) {
        let mut p = vec![0u8; 60];
        p[14] = 0x45;
        p[23] = 17;
        p[26..30].copy_from_slice(&[192, 168, 1, 1]);
        p[30..34].copy_from_slice(&[10, 0, 0, 1]);
        let mut meta = PacketMeta {
            ts,
            wire_len: len,
            cap_len: 60,
            ..PacketMeta::default()
        };
        meta.offs = [0, 14, 34, 42];
        for &m in matched {
            meta.push_match(m);
        }
        (meta, p)
    }

    fn proc_with_rule(r: &Rule) -> PacketProcessor {
        let mut proc = PacketProcessor::new(Arc::new(ModuleRegistry::builtin()));
        proc.check_rules(&[r]).unwrap();
        proc.add_rules(&[r]).unwrap();
        proc
    }

    #[test]
    fn test_single_flow_counting() {
        let r = rule(0, vec![ModuleSpec::new("count")]);
        let mut proc = proc_with_rule(&r);
        for (ts, len) in [(1_000_000, 100), (2_000_000, 200), (3_000_000, 300)] {
            let (meta, p) = udp_meta(ts, len, &[0]);
            assert!(proc.process(&meta, &p).is_empty());
        }
        let rec = proc.export_rule(0, 4_000_000, false).unwrap();
        assert_eq!(rec.metrics.len(), 1);
        assert_eq!(rec.metrics[0].flows.len(), 1);
        let block = &rec.metrics[0].flows[0];
        assert!(block.new_flow);
        let fields =
            decode_record(crate::modules::count::CountModule.schema(), &block.data).unwrap();
        assert_eq!(fields[0].1, Value::UInt(3)); // packets
        assert_eq!(fields[1].1, Value::UInt(600)); // volume
        assert_eq!(fields[2].1, Value::UInt(1)); // first_time
        assert_eq!(fields[4].1, Value::UInt(3)); // last_time

        // the interval reset leaves a fresh accumulator behind
        let rec = proc.export_rule(0, 5_000_000, false).unwrap();
        let block = &rec.metrics[0].flows[0];
        assert!(!block.new_flow);
        let fields =
            decode_record(crate::modules::count::CountModule.schema(), &block.data).unwrap();
        assert_eq!(fields[0].1, Value::UInt(0));
    }

    #[test]
    fn test_auto_flows_key_separation() {
        let mut r = rule(0, vec![ModuleSpec::new("count")]);
        r.auto_flows = true;
        r.filters = vec![proto_filter(), src_ip_filter()];
        let mut proc = proc_with_rule(&r);

        let (meta, p) = udp_meta(1, 100, &[0]);
        proc.process(&meta, &p);
        let (meta, mut p2) = udp_meta(2, 100, &[0]);
        p2[26..30].copy_from_slice(&[192, 168, 1, 2]);
        proc.process(&meta, &p2);
        assert_eq!(proc.flow_count(0), 2);
    }

    #[test]
    fn test_bidir_shared_flow_without_sep_paths() {
        let mut r = rule(0, vec![ModuleSpec::new("flowstats")]);
        r.bidir = true;
        r.auto_flows = true;
        r.filters = vec![src_ip_filter()];
        let mut proc = proc_with_rule(&r);

        // forward: src 192.168.1.1
        let (meta, p) = udp_meta(1, 100, &[0]);
        proc.process(&meta, &p);
        // reverse: same flow seen from the other side
        let (mut meta, mut p2) = udp_meta(2, 150, &[0]);
        p2[26..30].copy_from_slice(&[10, 0, 0, 1]);
        p2[30..34].copy_from_slice(&[192, 168, 1, 1]);
        meta.reverse = true;
        proc.process(&meta, &p2);

        assert_eq!(proc.flow_count(0), 1);
        let rec = proc.export_rule(0, 3, false).unwrap();
        let block = &rec.metrics[0].flows[0];
        let fields =
            decode_record(crate::modules::flowstats::FlowStatsModule.schema(), &block.data)
                .unwrap();
        assert_eq!(fields[0].1, Value::UInt(1)); // fpackets
        assert_eq!(fields[2].1, Value::UInt(1)); // bpackets
    }

    #[test]
    fn test_sep_paths_split_flows() {
        let mut r = rule(0, vec![ModuleSpec::new("count")]);
        r.bidir = true;
        r.sep_paths = true;
        r.auto_flows = true;
        r.filters = vec![src_ip_filter()];
        let mut proc = proc_with_rule(&r);

        let (meta, p) = udp_meta(1, 100, &[0]);
        proc.process(&meta, &p);
        let (mut meta, mut p2) = udp_meta(2, 150, &[0]);
        p2[26..30].copy_from_slice(&[10, 0, 0, 1]);
        p2[30..34].copy_from_slice(&[192, 168, 1, 1]);
        meta.reverse = true;
        proc.process(&meta, &p2);

        // same endpoints, two paths, two flow records
        assert_eq!(proc.flow_count(0), 2);
    }

    #[test]
    fn test_idle_timeout_expires_flow() {
        let mut r = rule(0, vec![ModuleSpec::new("count")]);
        r.flow_timeout = FlowTimeout::Secs(30);
        let mut proc = proc_with_rule(&r);

        let (meta, p) = udp_meta(1_000_000, 100, &[0]);
        proc.process(&meta, &p);

        // not yet
        let (rec, next) = proc.check_idle(0, 30, 10_000_000);
        assert!(rec.is_none());
        assert_eq!(next, Some(31_000_000));

        // at t=31s the flow is 30s idle: final record, flow gone
        let (rec, next) = proc.check_idle(0, 30, 31_000_000);
        let rec = rec.unwrap();
        assert!(rec.final_rec);
        assert_eq!(rec.metrics[0].flows.len(), 1);
        assert!(next.is_none());
        assert_eq!(proc.flow_count(0), 0);

        // and nothing further
        let (rec, _) = proc.check_idle(0, 30, 62_000_000);
        assert!(rec.is_none());
    }

    #[test]
    fn test_immediate_export_on_tcp_close() {
        let r = rule(0, vec![ModuleSpec::new("flowstats")]);
        let mut proc = proc_with_rule(&r);

        let mk = |flags: u8, rev: bool, ts: u64| {
            let mut p = vec![0u8; 60];
            p[14] = 0x45;
            p[23] = 6;
            p[47] = flags;
            let mut meta = PacketMeta {
                ts,
                wire_len: 60,
                cap_len: 60,
                reverse: rev,
                trans: meter_common::TransProto::Tcp,
                ..PacketMeta::default()
            };
            meta.offs = [0, 14, 34, 54];
            meta.push_match(0);
            (meta, p)
        };

        // SYN, SYN/ACK, ACK, data, FIN
        for (flags, rev, ts) in [
            (0x02, false, 1),
            (0x12, true, 2),
            (0x10, false, 3),
            (0x18, false, 4),
            (0x11, false, 5),
        ] {
            let (meta, p) = mk(flags, rev, ts);
            assert!(proc.process(&meta, &p).is_empty());
        }
        // FIN/ACK from the other side triggers exactly one final record
        let (meta, p) = mk(0x11, true, 6);
        let recs = proc.process(&meta, &p);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].final_rec);
    }

    #[test]
    fn test_del_rule_releases_modules() {
        let r = rule(0, vec![ModuleSpec::new("count"), ModuleSpec::new("pktlen")]);
        let mut proc = proc_with_rule(&r);
        assert_eq!(proc.registry().refcount("count"), 1);
        proc.del_rule(0);
        assert_eq!(proc.registry().refcount("count"), 0);
        assert_eq!(proc.task_count(), 0);
    }

    #[test]
    fn test_unknown_module_rejected_without_leak() {
        let mut proc = PacketProcessor::new(Arc::new(ModuleRegistry::builtin()));
        let r = rule(0, vec![ModuleSpec::new("count"), ModuleSpec::new("nope")]);
        assert!(proc.check_rules(&[&r]).is_err());
        assert!(proc.add_rules(&[&r]).is_err());
        assert_eq!(proc.registry().refcount("count"), 0);
        assert_eq!(proc.task_count(), 0);
    }
}
