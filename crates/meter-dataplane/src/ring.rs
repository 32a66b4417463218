//! Bounded SPSC packet ring.
//!
//! Decouples capture from classification. Variable-length packet payloads
//! live back-to-back in one contiguous arena; a power-of-two descriptor
//! ring carries the metadata and the arena position of each packet. Every
//! reservation hands out a linear region of at least the configured
//! guarantee: when the arena tail cannot fit another guaranteed region the
//! remainder is abandoned and the producer wraps to the arena start.
//!
//! A full ring never blocks the producer; failed reservations drop the
//! packet and bump a counter. The consumer can block on a condition
//! variable that fires on the empty-to-non-empty transition.
//!
//! # Safety
//!
//! Arena access is unsynchronised by design. The accounting in `RingState`
//! keeps the producer's write region and the consumer's published regions
//! disjoint: the producer only writes `[cur, cur + guarantee)`, which the
//! free-memory check proves unoccupied, and it publishes a descriptor only
//! after the bytes are written (the descriptor is stored under the state
//! lock, which orders the writes). The consumer reads only published,
//! unreleased regions.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meter_common::PacketMeta;
use parking_lot::{Condvar, Mutex};

/// Guaranteed linear bytes per reservation: one max-size capture.
pub const DEFAULT_GUARANTEE: usize = 65536;

/// Average arena bytes reserved per descriptor; a round number somewhat
/// above the mean IP packet size.
pub const AVG_PKT_BYTES: usize = 300;

#[derive(Debug, Clone)]
struct Desc {
    meta: PacketMeta,
    pos: usize,
    len: usize,
}

struct RingState {
    descs: Box<[Option<Desc>]>,
    mask: usize,
    /// Producer index (next descriptor to publish)
    head: usize,
    /// Consumer index (oldest published descriptor)
    tail: usize,
    used: usize,
    /// Free arena bytes; abandoned tail fragments are accounted here and
    /// restored symmetrically on release
    free_mem: isize,
    /// Next arena write offset; invariant: `cur + guarantee <= capacity`
    cur: usize,
}

struct Shared {
    state: Mutex<RingState>,
    not_empty: Condvar,
    arena: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    guarantee: usize,
    dropped: AtomicU64,
}

impl Shared {
    #[inline(always)]
    fn arena_ptr(&self) -> *mut u8 {
        self.arena.as_ptr() as *mut u8
    }
}

// SPSC discipline: exactly one producer writes the arena, exactly one
// consumer reads it, and the regions they touch are disjoint (see module
// docs).
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Snapshot of ring occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    /// Published packets currently queued
    pub used_buffers: usize,
    /// Maximum descriptors
    pub max_buffers: usize,
    /// Arena bytes in use (including abandoned tail fragments)
    pub used_memory: usize,
    /// Arena size in bytes
    pub max_memory: usize,
    /// Packets dropped on full ring
    pub dropped: u64,
}

/// Bounded SPSC packet queue; split into producer and consumer halves.
pub struct PacketRing {
    shared: Arc<Shared>,
}

impl PacketRing {
    /// Ring with `max_pkts` descriptors (rounded up to a power of two) and
    /// an arena of `max_pkts * avg_pkt` bytes, at least one guarantee.
    pub fn new(max_pkts: usize, guarantee: usize, avg_pkt: usize) -> Self {
        let descs = max_pkts.next_power_of_two();
        let capacity = (max_pkts * avg_pkt).max(guarantee);
        let state = RingState {
            descs: vec![None; descs].into_boxed_slice(),
            mask: descs - 1,
            head: 0,
            tail: 0,
            used: 0,
            free_mem: capacity as isize,
            cur: 0,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                not_empty: Condvar::new(),
                arena: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
                capacity,
                guarantee,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Ring with default sizing for `max_pkts` packets.
    pub fn with_defaults(max_pkts: usize) -> Self {
        Self::new(max_pkts, DEFAULT_GUARANTEE, AVG_PKT_BYTES)
    }

    /// Split into the producer and consumer halves.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        (
            RingProducer {
                shared: self.shared.clone(),
            },
            RingConsumer {
                shared: self.shared,
            },
        )
    }
}

fn stats_of(shared: &Shared) -> RingStats {
    let st = shared.state.lock();
    RingStats {
        used_buffers: st.used,
        max_buffers: st.descs.len(),
        used_memory: (shared.capacity as isize - st.free_mem) as usize,
        max_memory: shared.capacity,
        dropped: shared.dropped.load(Ordering::Relaxed),
    }
}

/// Producer half: reserve, write, commit.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Reserve a linear region of `guarantee` bytes.
    ///
    /// Fails (and counts a drop) when the descriptor ring or the arena is
    /// full; never blocks.
    pub fn reserve(&mut self) -> Option<Reservation<'_>> {
        let offset = {
            let st = self.shared.state.lock();
            if st.used >= st.descs.len() || st.free_mem < self.shared.guarantee as isize {
                drop(st);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            st.cur
        };
        Some(Reservation {
            producer: self,
            offset,
        })
    }

    /// Guaranteed region size.
    pub fn guarantee(&self) -> usize {
        self.shared.guarantee
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> RingStats {
        stats_of(&self.shared)
    }

    fn commit_at(&mut self, offset: usize, meta: PacketMeta, used: usize) {
        debug_assert!(used <= self.shared.guarantee);
        let mut st = self.shared.state.lock();
        debug_assert_eq!(st.cur, offset);
        let head = st.head;
        let mask = st.mask;
        st.descs[head & mask] = Some(Desc {
            meta,
            pos: offset,
            len: used,
        });
        st.head = head.wrapping_add(1);
        st.used += 1;
        st.free_mem -= used as isize;
        st.cur += used;
        // not enough linear space before the arena end for the next
        // guarantee: abandon the tail and wrap
        if st.cur + self.shared.guarantee > self.shared.capacity {
            st.free_mem -= (self.shared.capacity - st.cur) as isize;
            st.cur = 0;
        }
        if st.used == 1 {
            self.shared.not_empty.notify_one();
        }
    }
}

/// An uncommitted reservation. Dropping it without `commit` abandons the
/// reservation without side effects.
pub struct Reservation<'a> {
    producer: &'a mut RingProducer,
    offset: usize,
}

impl Reservation<'_> {
    /// The writable region, `guarantee` bytes long.
    pub fn buf(&mut self) -> &mut [u8] {
        let g = self.producer.shared.guarantee;
        debug_assert!(self.offset + g <= self.producer.shared.capacity);
        // Safety: the free-memory check in `reserve` proved
        // [offset, offset+guarantee) unoccupied, and only this producer
        // writes the arena.
        unsafe {
            std::slice::from_raw_parts_mut(self.producer.shared.arena_ptr().add(self.offset), g)
        }
    }

    /// Publish the first `used` bytes together with the packet metadata.
    pub fn commit(self, meta: PacketMeta, used: usize) {
        let offset = self.offset;
        self.producer.commit_at(offset, meta, used);
    }
}

/// Consumer half: peek, read, release.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// The oldest queued packet, or None when empty.
    pub fn peek(&mut self) -> Option<QueuedPacket<'_>> {
        let (meta, pos, len) = {
            let st = self.shared.state.lock();
            if st.used == 0 {
                return None;
            }
            let d = st.descs[st.tail & st.mask].as_ref()?;
            (d.meta.clone(), d.pos, d.len)
        };
        Some(QueuedPacket {
            consumer: self,
            meta,
            pos,
            len,
        })
    }

    /// Like `peek`, but waits up to `timeout` for a packet.
    pub fn peek_timeout(&mut self, timeout: Duration) -> Option<QueuedPacket<'_>> {
        {
            let mut st = self.shared.state.lock();
            if st.used == 0 {
                self.shared.not_empty.wait_for(&mut st, timeout);
            }
            if st.used == 0 {
                return None;
            }
        }
        self.peek()
    }

    /// Discard the oldest packet, reclaiming its arena bytes.
    pub fn release(&mut self) {
        let mut st = self.shared.state.lock();
        if st.used == 0 {
            return;
        }
        let tail = st.tail;
        let mask = st.mask;
        if let Some(d) = st.descs[tail & mask].take() {
            st.free_mem += d.len as isize;
            let after = d.pos + d.len;
            // restore an abandoned tail fragment the producer skipped
            if after + self.shared.guarantee > self.shared.capacity {
                st.free_mem += (self.shared.capacity - after) as isize;
            }
        }
        st.tail = tail.wrapping_add(1);
        st.used -= 1;
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        while self.peek().is_some() {
            self.release();
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> RingStats {
        stats_of(&self.shared)
    }

    /// Reset the drop counter, returning the old value.
    pub fn reset_dropped(&self) -> u64 {
        self.shared.dropped.swap(0, Ordering::Relaxed)
    }
}

/// A borrowed view of the oldest queued packet.
pub struct QueuedPacket<'a> {
    consumer: &'a mut RingConsumer,
    /// Packet metadata (copied out; mutate freely, then hand downstream)
    pub meta: PacketMeta,
    pos: usize,
    len: usize,
}

impl QueuedPacket<'_> {
    /// The captured bytes.
    pub fn payload(&self) -> &[u8] {
        // Safety: this region is published and unreleased; the producer
        // will not touch it until `release`.
        unsafe {
            std::slice::from_raw_parts(
                self.consumer.shared.arena_ptr().add(self.pos) as *const u8,
                self.len,
            )
        }
    }

    /// Release the packet's arena space.
    pub fn release(self) {
        self.consumer.release();
    }
}
