//! Event scheduler.
//!
//! A monotonic priority queue of timed events with a strict total order
//! over `(timestamp, insertion sequence)`; ties resolve FIFO. Recurring
//! events re-arm from their scheduled time (aligned ones snap to
//! wall-clock interval boundaries), and a large time gap skips forward
//! instead of firing a burst of stale events.

use std::collections::BTreeMap;

use meter_common::{time::next_interval_boundary, UsecTs};
use tracing::trace;

use crate::event::{Event, EventTrim};

/// Events firing within this many µs of their deadline count as due.
const FIRE_FUZZ_US: u64 = 100;

/// A queued event with its recurrence settings.
#[derive(Debug, Clone)]
pub struct Scheduled {
    /// The event
    pub event: Event,
    /// Scheduled firing time
    pub time: UsecTs,
    /// Recurrence interval in µs; 0 for one-shot events
    pub interval_us: u64,
    /// Snap recurrences to wall-clock interval boundaries
    pub align: bool,
}

/// Monotonic timed-event queue.
#[derive(Debug, Default)]
pub struct EventScheduler {
    events: BTreeMap<(UsecTs, u64), Scheduled>,
    seq: u64,
}

impl EventScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot event.
    pub fn add(&mut self, time: UsecTs, event: Event) {
        self.add_recurring(time, event, 0, false);
    }

    /// Queue an event; a non-zero interval re-arms it after every firing.
    pub fn add_recurring(&mut self, time: UsecTs, event: Event, interval_us: u64, align: bool) {
        trace!(kind = event.kind(), time, interval_us, "event queued");
        let key = (time, self.seq);
        self.seq += 1;
        self.events.insert(
            key,
            Scheduled {
                event,
                time,
                interval_us,
                align,
            },
        );
    }

    /// Pop the next event due at or before `now` (with a 100µs fuzz).
    pub fn next_due(&mut self, now: UsecTs) -> Option<Scheduled> {
        let (&key, s) = self.events.iter().next()?;
        if s.time > now + FIRE_FUZZ_US {
            return None;
        }
        self.events.remove(&key)
    }

    /// Re-queue a recurring event after it fired; one-shot events are
    /// dropped.
    pub fn reschedule(&mut self, mut s: Scheduled, now: UsecTs) {
        if s.interval_us == 0 {
            return;
        }
        let mut next = if s.align {
            next_interval_boundary(s.time, s.interval_us, true)
        } else {
            s.time + s.interval_us
        };
        // after a time gap, resume the cadence instead of replaying it
        if next + FIRE_FUZZ_US < now {
            next = next_interval_boundary(now, s.interval_us, s.align);
        }
        s.time = next;
        let key = (next, self.seq);
        self.seq += 1;
        self.events.insert(key, s);
    }

    /// Earliest scheduled time, if any.
    pub fn next_time(&self) -> Option<UsecTs> {
        self.events.keys().next().map(|&(t, _)| t)
    }

    /// Remove a rule from every queued event, dropping emptied events.
    pub fn del_rule_events(&mut self, uid: u32) {
        let mut dead = Vec::new();
        for (key, s) in self.events.iter_mut() {
            if s.event.remove_rule(uid) == EventTrim::Empty {
                dead.push(*key);
            }
        }
        for key in dead {
            self.events.remove(&key);
        }
    }

    /// Queued event count.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
