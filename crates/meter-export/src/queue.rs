//! Bounded flow-record queue between processor and exporter.
//!
//! Pushes are block-free: a full queue drops the record and counts it.
//! Pops can wait on a condition variable; `wait_until_done` blocks until
//! the queue has drained, which the shutdown path uses before the final
//! exports.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use meter_proc::FlowRecord;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// A record queued for export, with the subset of the rule's export
/// modules it is destined for (empty set means all of them).
#[derive(Debug, Clone)]
pub struct QueuedRecord {
    /// Rule uid
    pub rule_id: u32,
    /// The record
    pub record: FlowRecord,
    /// Selected export modules; empty selects all configured
    pub modules: BTreeSet<String>,
}

struct Inner {
    q: VecDeque<QueuedRecord>,
    dropped: u64,
}

/// Bounded multi-producer queue of flow records.
pub struct FlowRecordQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    drained: Condvar,
    capacity: usize,
}

impl FlowRecordQueue {
    /// Queue holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                q: VecDeque::with_capacity(capacity.min(1024)),
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
            capacity,
        }
    }

    /// Queue a record. Returns false (and counts a drop) when full.
    pub fn push(&self, rec: QueuedRecord) -> bool {
        let mut inner = self.inner.lock();
        if inner.q.len() >= self.capacity {
            inner.dropped += 1;
            warn!(rule = rec.rule_id, "flow record queue full, record dropped");
            return false;
        }
        inner.q.push_back(rec);
        if inner.q.len() == 1 {
            self.not_empty.notify_one();
        }
        true
    }

    /// Take the oldest record, waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<QueuedRecord> {
        let mut inner = self.inner.lock();
        if inner.q.is_empty() {
            self.not_empty.wait_for(&mut inner, timeout);
        }
        let rec = inner.q.pop_front();
        if inner.q.is_empty() {
            self.drained.notify_all();
        }
        rec
    }

    /// Take the oldest record without waiting.
    pub fn try_pop(&self) -> Option<QueuedRecord> {
        let mut inner = self.inner.lock();
        let rec = inner.q.pop_front();
        if inner.q.is_empty() {
            self.drained.notify_all();
        }
        rec
    }

    /// Block until the queue is empty (bounded by `timeout`).
    pub fn wait_until_done(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if !inner.q.is_empty() {
            self.drained.wait_for(&mut inner, timeout);
        }
        inner.q.is_empty()
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().q.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records dropped on a full queue.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}
