//! Engine: the cooperative main loop wiring tap, classifier, processor
//! and exporter together under the event scheduler.
//!
//! The main loop dispatches due events, services the control channel,
//! reads packets from the tap and drives whichever pipeline stages run
//! inline. The metering stage (classify + process) and the export stage
//! can each run on their own worker thread; workers block on their input
//! queue and are joined on shutdown.
//!
//! Trace replay pre-dispatches events due at or before a packet's
//! timestamp before that packet is classified, so a rule active at time T
//! is observable to the classifier for every packet stamped T or later.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info, warn};

use meter_classifier::{Classifier, RfcClassifier, SimpleClassifier};
use meter_common::{
    time::next_interval_boundary, Clock, MeterError, MeterResult, Rule, RuleState, SystemClock,
    TraceClock, UsecTs, USECS_PER_SEC,
};
use meter_dataplane::{
    PacketRing, PacketSource, RingConsumer, RingProducer, Sampler, TapPoll, TapReader,
};
use meter_export::{ExportRegistry, Exporter, FlowRecordQueue, QueuedRecord};
use meter_proc::{ModuleRegistry, PacketProcessor};

use crate::event::Event;
use crate::scheduler::{EventScheduler, Scheduled};

/// Classifier backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    /// Linear matcher
    Simple,
    /// Recursive Flow Classification
    Rfc,
}

/// Engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Which classifier backend to run
    pub classifier: ClassifierKind,
    /// Packet ring capacity in packets
    pub ring_packets: usize,
    /// Flow record queue capacity
    pub record_queue: usize,
    /// Run classify+process on a worker thread
    pub metering_thread: bool,
    /// Run the exporter on a worker thread
    pub exporter_thread: bool,
    /// Main loop idle poll interval in milliseconds
    pub poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::Rfc,
            ring_packets: 4096,
            record_queue: 8192,
            metering_thread: false,
            exporter_thread: false,
            poll_ms: 100,
        }
    }
}

/// Classifier and processor behind one lock: the classifier feeds the
/// processor synchronously, so they share the metering stage.
struct MeterCore {
    classifier: Box<dyn Classifier>,
    processor: PacketProcessor,
}

/// Rule selection for `rm_task`.
#[derive(Debug, Clone)]
pub enum TaskSelector {
    /// By uid
    Uid(u32),
    /// By `set` and optional rule name (None removes the whole set)
    Name {
        /// Rule set
        set: String,
        /// Rule within the set
        name: Option<String>,
    },
}

/// Control-channel operations.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    /// Install and activate a parsed rule
    AddTask(Box<Rule>),
    /// Deactivate, final-export and remove rules
    RmTask(TaskSelector),
    /// Status and inventory
    GetInfo,
    /// Module schema and metadata
    GetModInfo(String),
}

/// Structured control reply: payload or `(code, message)`.
pub type ControlReply = Result<serde_json::Value, (String, String)>;

struct ControlMsg {
    req: ControlRequest,
    reply: Sender<ControlReply>,
}

/// Cloneable handle submitting control requests into the main loop.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlMsg>,
}

impl ControlHandle {
    /// Send a request and wait for the reply.
    pub fn request(&self, req: ControlRequest) -> ControlReply {
        let (tx, rx) = bounded(1);
        if self.tx.send(ControlMsg { req, reply: tx }).is_err() {
            return Err(("shutdown".into(), "engine is not running".into()));
        }
        rx.recv()
            .unwrap_or_else(|_| Err(("shutdown".into(), "engine stopped".into())))
    }
}

/// The metering daemon core.
pub struct Engine {
    cfg: EngineConfig,
    clock: Arc<dyn Clock>,
    offline: bool,
    scheduler: EventScheduler,
    manager: crate::manager::RuleManager,
    core: Arc<Mutex<MeterCore>>,
    exporter: Arc<Mutex<Exporter>>,
    records: Arc<FlowRecordQueue>,
    tap: TapReader,
    producer: RingProducer,
    consumer: Option<RingConsumer>,
    ctl_tx: Sender<ControlMsg>,
    ctl_rx: Receiver<ControlMsg>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build an engine over one packet source.
    pub fn new(
        cfg: EngineConfig,
        source: Box<dyn PacketSource>,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        let offline = !source.is_online();
        let trace_clock = offline.then(|| Arc::new(TraceClock::new()));
        let clock: Arc<dyn Clock> = match &trace_clock {
            Some(c) => c.clone(),
            None => Arc::new(SystemClock),
        };

        let metrics = Arc::new(ModuleRegistry::builtin());
        let exports = Arc::new(ExportRegistry::builtin(metrics.clone()));

        let classifier: Box<dyn Classifier> = match cfg.classifier {
            ClassifierKind::Simple => Box::new(SimpleClassifier::new()),
            ClassifierKind::Rfc => Box::new(RfcClassifier::new()),
        };
        let core = Arc::new(Mutex::new(MeterCore {
            classifier,
            processor: PacketProcessor::new(metrics),
        }));

        let (producer, consumer) = PacketRing::with_defaults(cfg.ring_packets).split();
        let (ctl_tx, ctl_rx) = crossbeam::channel::unbounded();

        Self {
            records: Arc::new(FlowRecordQueue::new(cfg.record_queue)),
            exporter: Arc::new(Mutex::new(Exporter::new(exports))),
            tap: TapReader::new(source, sampler, trace_clock),
            producer,
            consumer: Some(consumer),
            scheduler: EventScheduler::new(),
            manager: crate::manager::RuleManager::new(),
            core,
            clock,
            offline,
            cfg,
            ctl_tx,
            ctl_rx,
            running: Arc::new(AtomicBool::new(true)),
            workers: Vec::new(),
        }
    }

    /// Handle for the control channel.
    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            tx: self.ctl_tx.clone(),
        }
    }

    /// Flag that stops the main loop when cleared.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// The engine clock.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    // ---------------------------------------------------------------
    // rule lifecycle
    // ---------------------------------------------------------------

    /// Install a parsed rule: validate against every component, then
    /// schedule its activation at start time.
    pub fn add_task(&mut self, rule: Rule) -> MeterResult<u32> {
        let now = self.clock.now_us();
        let uid = self.manager.install(rule, now)?;
        let rule = self
            .manager
            .get(uid)
            .cloned()
            .ok_or_else(|| MeterError::NoSuchRule(uid.to_string()))?;

        let checks = {
            let core = self.core.lock();
            core.classifier
                .check_rules(&[&rule])
                .and_then(|()| core.processor.check_rules(&[&rule]))
                .and_then(|()| self.exporter.lock().check_rules(&[&rule]))
        };
        if let Err(e) = checks {
            // no side effect survives a failed install
            self.manager.rollback(uid);
            return Err(e);
        }

        self.manager.set_state(uid, RuleState::Scheduled);
        self.scheduler
            .add(rule.start, Event::ActivateRules(vec![uid]));
        Ok(uid)
    }

    /// Resolve a selector and remove the matching rules.
    pub fn rm_task(&mut self, sel: &TaskSelector) -> MeterResult<usize> {
        let uids = match sel {
            TaskSelector::Uid(uid) => {
                if self.manager.get(*uid).is_none() {
                    return Err(MeterError::NoSuchRule(uid.to_string()));
                }
                vec![*uid]
            }
            TaskSelector::Name { set, name } => match name {
                Some(name) => vec![self
                    .manager
                    .lookup(set, name)
                    .ok_or_else(|| MeterError::NoSuchRule(format!("{set}.{name}")))?],
                None => {
                    let uids = self.manager.uids_of_set(set);
                    if uids.is_empty() {
                        return Err(MeterError::NoSuchRule(set.clone()));
                    }
                    uids
                }
            },
        };
        let now = self.clock.now_us();
        let n = uids.len();
        self.remove_rules(&uids, now);
        Ok(n)
    }

    fn activate_rules(&mut self, uids: &[u32], when: UsecTs) {
        for &uid in uids {
            let Some(rule) = self.manager.get(uid).cloned() else {
                continue;
            };
            {
                let mut core = self.core.lock();
                if let Err(e) = core.classifier.add_rules(&[&rule]) {
                    error!(uid, error = %e, "classifier rejected rule at activation");
                    drop(core);
                    self.manager.set_state(uid, RuleState::Error);
                    continue;
                }
                if let Err(e) = core.processor.add_rules(&[&rule]) {
                    error!(uid, error = %e, "processor rejected rule at activation");
                    core.classifier.del_rules(&[&rule]);
                    drop(core);
                    self.manager.set_state(uid, RuleState::Error);
                    continue;
                }
            }
            match self.exporter.lock().add_rule(&rule) {
                Ok(timers) => {
                    for (module, t) in timers {
                        let ival = t.interval_ms as u64 * 1000;
                        let first = next_interval_boundary(when, ival, t.aligned);
                        self.scheduler.add_recurring(
                            first,
                            Event::ExportModuleTimer { module, timer: t },
                            if t.recurring { ival } else { 0 },
                            t.aligned,
                        );
                    }
                }
                Err(e) => {
                    error!(uid, error = %e, "exporter rejected rule at activation");
                    let mut core = self.core.lock();
                    core.classifier.del_rules(&[&rule]);
                    core.processor.del_rule(uid);
                    drop(core);
                    self.manager.set_state(uid, RuleState::Error);
                    continue;
                }
            }

            // export intervals, one event per interval and module group
            for (ispec, modules) in rule.intervals() {
                let first = next_interval_boundary(when, ispec.interval_us(), ispec.align);
                self.scheduler.add_recurring(
                    first,
                    Event::Export {
                        uids: vec![uid],
                        interval: ispec,
                        modules,
                    },
                    ispec.interval_us(),
                    ispec.align,
                );
            }

            // idle flow expiry
            if let Some(t) = rule.flow_timeout.secs() {
                self.scheduler.add(
                    when + t * USECS_PER_SEC,
                    Event::FlowTimeout {
                        uid,
                        timeout_s: t,
                    },
                );
            }

            // per-module timers
            for (module, t) in self.core.lock().processor.module_timers(uid) {
                let ival = t.interval_ms as u64 * 1000;
                let first = next_interval_boundary(when, ival, t.aligned);
                self.scheduler.add_recurring(
                    first,
                    Event::ProcModuleTimer {
                        uid,
                        module,
                        timer: t,
                    },
                    if t.recurring { ival } else { 0 },
                    t.aligned,
                );
            }

            // lifetime end
            if let Some(stop) = rule.stop {
                self.scheduler.add(stop, Event::RemoveRules(vec![uid]));
            }

            self.manager.set_state(uid, RuleState::Active);
            info!(uid, ident = %rule.ident(), "rule active");
        }
    }

    fn remove_rules(&mut self, uids: &[u32], when: UsecTs) {
        for &uid in uids {
            let Some(rule) = self.manager.get(uid).cloned() else {
                continue;
            };
            if rule.state == RuleState::Active {
                // final export before teardown
                if let Some(rec) = self.core.lock().processor.export_rule(uid, when, true) {
                    self.records.push(QueuedRecord {
                        rule_id: uid,
                        record: rec,
                        modules: BTreeSet::new(),
                    });
                }
                if self.cfg.exporter_thread {
                    // the worker must deliver the final record before the
                    // export instances disappear
                    self.records.wait_until_done(Duration::from_secs(2));
                } else {
                    self.drain_records();
                }
                let mut core = self.core.lock();
                core.classifier.del_rules(&[&rule]);
                core.processor.del_rule(uid);
                drop(core);
                self.exporter.lock().del_rule(uid);
            }
            self.scheduler.del_rule_events(uid);
            self.manager.remove(uid);
        }
    }

    // ---------------------------------------------------------------
    // event dispatch
    // ---------------------------------------------------------------

    fn dispatch_due(&mut self, now: UsecTs) {
        while let Some(s) = self.scheduler.next_due(now) {
            self.handle_event(s, now);
        }
    }

    fn handle_event(&mut self, s: Scheduled, now: UsecTs) {
        // records carry the scheduled time, which in trace replay is the
        // exact trace-clock deadline rather than the packet that revealed it
        let when = s.time;
        debug!(kind = s.event.kind(), when, "event fired");
        match &s.event {
            Event::ActivateRules(uids) => {
                let uids = uids.clone();
                self.activate_rules(&uids, when);
            }
            Event::RemoveRules(uids) => {
                let uids = uids.clone();
                self.remove_rules(&uids, when);
            }
            Event::Export { uids, modules, .. } => {
                for &uid in uids {
                    if let Some(rec) = self.core.lock().processor.export_rule(uid, when, false) {
                        self.records.push(QueuedRecord {
                            rule_id: uid,
                            record: rec,
                            modules: modules.clone(),
                        });
                    }
                }
            }
            Event::FlowTimeout { uid, timeout_s } => {
                let (rec, next) = self
                    .core
                    .lock()
                    .processor
                    .check_idle(*uid, *timeout_s, when);
                if let Some(rec) = rec {
                    self.records.push(QueuedRecord {
                        rule_id: *uid,
                        record: rec,
                        modules: BTreeSet::new(),
                    });
                }
                // re-arm at the next possible expiry
                let next = next.unwrap_or(when + timeout_s * USECS_PER_SEC);
                self.scheduler.add(
                    next,
                    Event::FlowTimeout {
                        uid: *uid,
                        timeout_s: *timeout_s,
                    },
                );
            }
            Event::ProcModuleTimer { uid, module, timer } => {
                self.core
                    .lock()
                    .processor
                    .module_timeout(*uid, module, timer.id);
            }
            Event::ExportModuleTimer { module, timer } => {
                self.exporter.lock().module_timeout(module, timer.id);
            }
            Event::Shutdown => {
                self.running.store(false, Ordering::Release);
            }
        }
        self.scheduler.reschedule(s, now);
    }

    // ---------------------------------------------------------------
    // pipeline stages
    // ---------------------------------------------------------------

    /// Classify and process every queued packet (inline metering stage).
    fn drain_ring(&mut self) {
        let Some(consumer) = self.consumer.as_mut() else {
            return;
        };
        while let Some(pkt) = consumer.peek() {
            let mut meta = pkt.meta.clone();
            let recs = {
                let mut core = self.core.lock();
                let payload = pkt.payload();
                core.classifier.classify(&mut meta, payload);
                core.processor.process(&meta, payload)
            };
            pkt.release();
            for rec in recs {
                self.records.push(QueuedRecord {
                    rule_id: rec.rule_id,
                    record: rec,
                    modules: BTreeSet::new(),
                });
            }
        }
    }

    /// Deliver every queued record (inline export stage).
    fn drain_records(&mut self) {
        while let Some(rec) = self.records.try_pop() {
            self.exporter.lock().export(rec);
        }
    }

    fn handle_control(&mut self) {
        while let Ok(msg) = self.ctl_rx.try_recv() {
            let reply = self.serve(msg.req);
            let _ = msg.reply.send(reply);
        }
    }

    fn serve(&mut self, req: ControlRequest) -> ControlReply {
        match req {
            ControlRequest::AddTask(rule) => self
                .add_task(*rule)
                .map(|uid| json!({ "uid": uid }))
                .map_err(|e| (e.code().to_string(), e.to_string())),
            ControlRequest::RmTask(sel) => self
                .rm_task(&sel)
                .map(|n| json!({ "removed": n }))
                .map_err(|e| (e.code().to_string(), e.to_string())),
            ControlRequest::GetInfo => Ok(self.info()),
            ControlRequest::GetModInfo(name) => {
                let core = self.core.lock();
                let registry = core.processor.registry();
                registry
                    .schema_of(&name)
                    .map(|schema| {
                        json!({
                            "module": name,
                            "refcount": registry.refcount(&name),
                            "schema": schema
                                .iter()
                                .map(|t| json!({
                                    "type": format!("{:?}", t.ty),
                                    "label": t.label,
                                }))
                                .collect::<Vec<_>>(),
                        })
                    })
                    .map_err(|e| (e.code().to_string(), e.to_string()))
            }
        }
    }

    /// Status snapshot for the control channel.
    pub fn info(&self) -> serde_json::Value {
        let core = self.core.lock();
        let ring = self.producer.stats();
        let tap = self.tap.stats();
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "classifier": core.classifier.name(),
            "time_us": self.clock.now_us(),
            "offline": self.offline,
            "tasks": self.manager.len(),
            "task_idents": self.manager.idents(),
            "modules": core.processor.registry().names(),
            "export_modules": self.exporter.lock().registry().names(),
            "ring": {
                "used_buffers": ring.used_buffers,
                "used_memory": ring.used_memory,
                "max_memory": ring.max_memory,
                "dropped": ring.dropped,
            },
            "tap": {
                "packets": tap.packets,
                "bytes": tap.bytes,
                "filtered": tap.filtered,
                "dropped_reorder": tap.dropped_reorder,
                "dropped_full": tap.dropped_full,
            },
            "record_queue": {
                "queued": self.records.len(),
                "dropped": self.records.dropped(),
            },
            "events": self.scheduler.len(),
        })
    }

    // ---------------------------------------------------------------
    // main loop
    // ---------------------------------------------------------------

    fn spawn_workers(&mut self) {
        if self.cfg.metering_thread {
            let mut consumer = self.consumer.take().expect("consumer available");
            let core = self.core.clone();
            let records = self.records.clone();
            let running = self.running.clone();
            self.workers.push(std::thread::spawn(move || {
                let step = |consumer: &mut RingConsumer, block: bool| -> bool {
                    let pkt = if block {
                        consumer.peek_timeout(Duration::from_millis(50))
                    } else {
                        consumer.peek()
                    };
                    let Some(pkt) = pkt else { return false };
                    let mut meta = pkt.meta.clone();
                    let recs = {
                        let mut core = core.lock();
                        let payload = pkt.payload();
                        core.classifier.classify(&mut meta, payload);
                        core.processor.process(&meta, payload)
                    };
                    pkt.release();
                    for rec in recs {
                        records.push(QueuedRecord {
                            rule_id: rec.rule_id,
                            record: rec,
                            modules: BTreeSet::new(),
                        });
                    }
                    true
                };
                while running.load(Ordering::Acquire) {
                    step(&mut consumer, true);
                }
                // drain what is left before exiting
                while step(&mut consumer, false) {}
            }));
        }
        if self.cfg.exporter_thread {
            let exporter = self.exporter.clone();
            let records = self.records.clone();
            let running = self.running.clone();
            self.workers.push(std::thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    if let Some(rec) = records.pop(Duration::from_millis(50)) {
                        exporter.lock().export(rec);
                    }
                }
                // drain what is left before exiting
                while let Some(rec) = records.try_pop() {
                    exporter.lock().export(rec);
                }
            }));
        }
    }

    /// Run until the source is exhausted (trace replay) or the running
    /// flag is cleared.
    pub fn run(&mut self) -> MeterResult<()> {
        info!(
            offline = self.offline,
            classifier = ?self.cfg.classifier,
            metering_thread = self.cfg.metering_thread,
            exporter_thread = self.cfg.exporter_thread,
            "engine starting"
        );
        self.spawn_workers();

        while self.running.load(Ordering::Acquire) {
            let now = self.clock.now_us();
            self.dispatch_due(now);
            self.handle_control();

            match self.tap.poll(&mut self.producer)? {
                TapPoll::Queued(ts) => {
                    if self.offline {
                        // events due at or before this packet's time fire
                        // before the packet is classified
                        self.dispatch_due(ts);
                    }
                    if !self.cfg.metering_thread {
                        self.drain_ring();
                    }
                    if !self.cfg.exporter_thread {
                        self.drain_records();
                    }
                }
                TapPoll::Dropped | TapPoll::Filtered => {
                    // a full ring recovers once the inline stages catch up
                    if !self.cfg.metering_thread {
                        self.drain_ring();
                    }
                    if !self.cfg.exporter_thread {
                        self.drain_records();
                    }
                }
                TapPoll::Exhausted => {
                    if self.offline {
                        break;
                    }
                    // idle: wait for control traffic up to the next event
                    let wait = self
                        .scheduler
                        .next_time()
                        .map(|t| t.saturating_sub(self.clock.now_us()) / 1000)
                        .unwrap_or(self.cfg.poll_ms)
                        .clamp(1, self.cfg.poll_ms.max(1));
                    if let Ok(msg) = self.ctl_rx.recv_timeout(Duration::from_millis(wait)) {
                        let reply = self.serve(msg.req);
                        let _ = msg.reply.send(reply);
                    }
                    if !self.cfg.metering_thread {
                        self.drain_ring();
                    }
                    if !self.cfg.exporter_thread {
                        self.drain_records();
                    }
                }
            }
        }

        self.finish();
        Ok(())
    }

    /// Shutdown drain: remaining packets, pending records, one final
    /// export per active rule, then worker teardown.
    fn finish(&mut self) {
        let now = self.clock.now_us();
        info!("engine draining");

        // workers drain their input queues on the way out
        self.running.store(false, Ordering::Release);
        let threaded = !self.workers.is_empty();
        for w in self.workers.drain(..) {
            if w.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        self.cfg.metering_thread = false;
        self.cfg.exporter_thread = false;

        self.drain_ring();
        self.drain_records();

        let active = self.manager.uids_in_state(RuleState::Active);
        self.remove_rules(&active, now);
        let scheduled = self.manager.uids_in_state(RuleState::Scheduled);
        for uid in scheduled {
            self.scheduler.del_rule_events(uid);
            self.manager.remove(uid);
        }
        self.drain_records();

        if threaded {
            debug!("workers joined");
        }
        info!("engine stopped");
    }
}
