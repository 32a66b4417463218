//! Tap adapter: source → parse → sample → ring.

use std::sync::Arc;

use meter_common::{MeterResult, PacketMeta, TraceClock, UsecTs};
use tracing::debug;

use crate::parse::{parse_layers, LinkType};
use crate::ring::RingProducer;
use crate::sampler::Sampler;
use crate::source::PacketSource;

/// Outcome of one tap poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapPoll {
    /// A packet was parsed, sampled and queued; carries its timestamp
    Queued(UsecTs),
    /// A packet was read but dropped (full ring or trace reordering)
    Dropped,
    /// A packet was read but the sampler filtered it out
    Filtered,
    /// The source has no more packets
    Exhausted,
}

/// Per-tap counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TapStats {
    /// Packets queued into the ring
    pub packets: u64,
    /// Captured bytes queued
    pub bytes: u64,
    /// Packets removed by the sampler
    pub filtered: u64,
    /// Trace packets dropped for moving time backwards
    pub dropped_reorder: u64,
    /// Packets dropped on a full ring
    pub dropped_full: u64,
}

/// Reads packets from one source and feeds the packet ring.
pub struct TapReader {
    source: Box<dyn PacketSource>,
    sampler: Box<dyn Sampler>,
    /// Present when replaying a trace; advanced from packet timestamps
    trace_clock: Option<Arc<TraceClock>>,
    link: LinkType,
    scratch: Vec<u8>,
    stats: TapStats,
}

impl TapReader {
    /// Tap over `source`, gated by `sampler`. Offline sources drive
    /// `trace_clock`.
    pub fn new(
        source: Box<dyn PacketSource>,
        sampler: Box<dyn Sampler>,
        trace_clock: Option<Arc<TraceClock>>,
    ) -> Self {
        let link = source.link_type();
        Self {
            source,
            sampler,
            trace_clock,
            link,
            scratch: vec![0u8; crate::ring::DEFAULT_GUARANTEE],
            stats: TapStats::default(),
        }
    }

    /// True for live capture sources.
    pub fn is_online(&self) -> bool {
        self.source.is_online()
    }

    /// Counters so far.
    pub fn stats(&self) -> TapStats {
        self.stats
    }

    /// Read one packet from the source and queue it.
    pub fn poll(&mut self, producer: &mut RingProducer) -> MeterResult<TapPoll> {
        let Some(mut slot) = producer.reserve() else {
            // lossy by contract: consume the packet so a stalled consumer
            // cannot wedge the capture path
            return match self.source.next(&mut self.scratch)? {
                Some(_) => {
                    self.stats.dropped_full += 1;
                    Ok(TapPoll::Dropped)
                }
                None => Ok(TapPoll::Exhausted),
            };
        };

        let buf = slot.buf();
        let Some(cap) = self.source.next(buf)? else {
            return Ok(TapPoll::Exhausted);
        };

        let mut meta = PacketMeta {
            ts: cap.ts,
            wire_len: cap.wire_len,
            cap_len: cap.cap_len,
            ..PacketMeta::default()
        };

        // trace time must be monotonic; reordered packets are dropped
        if let Some(clock) = &self.trace_clock {
            if !clock.advance(cap.ts) {
                self.stats.dropped_reorder += 1;
                debug!(ts = cap.ts, "trace packet moves time backwards, dropped");
                return Ok(TapPoll::Dropped);
            }
        }

        parse_layers(&mut meta, &buf[..cap.cap_len as usize], self.link);

        if !self.sampler.sample(&meta) {
            self.stats.filtered += 1;
            return Ok(TapPoll::Filtered);
        }

        let ts = meta.ts;
        self.stats.packets += 1;
        self.stats.bytes += cap.cap_len as u64;
        slot.commit(meta, cap.cap_len as usize);
        Ok(TapPoll::Queued(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::PacketRing;
    use crate::sampler::{EveryNthSampler, SampleAll};
    use crate::source::MemorySource;
    use meter_common::Clock;

    fn udp_bytes() -> Vec<u8> {
        let mut p = vec![0u8; 60];
        p[12] = 0x08;
        p[14] = 0x45;
        p[23] = 17;
        p
    }

    #[test]
    fn test_tap_queues_parsed_packets() {
        let src = MemorySource::new(
            vec![(1_000, udp_bytes()), (2_000, udp_bytes())],
            LinkType::Ethernet,
        );
        let mut tap = TapReader::new(Box::new(src), Box::new(SampleAll), None);
        let (mut prod, mut cons) = PacketRing::with_defaults(16).split();

        assert_eq!(tap.poll(&mut prod).unwrap(), TapPoll::Queued(1_000));
        assert_eq!(tap.poll(&mut prod).unwrap(), TapPoll::Queued(2_000));
        assert_eq!(tap.poll(&mut prod).unwrap(), TapPoll::Exhausted);

        let p = cons.peek().unwrap();
        assert_eq!(p.meta.offs, [0, 14, 34, 42]);
        assert_eq!(p.meta.ts, 1_000);
        p.release();
        assert_eq!(tap.stats().packets, 2);
    }

    #[test]
    fn test_trace_clock_reordering_drop() {
        let clock = Arc::new(TraceClock::new());
        let src = MemorySource::new(
            vec![
                (5_000, udp_bytes()),
                (3_000, udp_bytes()), // out of order
                (6_000, udp_bytes()),
            ],
            LinkType::Ethernet,
        );
        let mut tap = TapReader::new(Box::new(src), Box::new(SampleAll), Some(clock.clone()));
        let (mut prod, _cons) = PacketRing::with_defaults(16).split();

        assert_eq!(tap.poll(&mut prod).unwrap(), TapPoll::Queued(5_000));
        assert_eq!(tap.poll(&mut prod).unwrap(), TapPoll::Dropped);
        assert_eq!(tap.poll(&mut prod).unwrap(), TapPoll::Queued(6_000));
        assert_eq!(tap.stats().dropped_reorder, 1);
        assert_eq!(clock.now_us(), 6_000);
    }

    #[test]
    fn test_sampler_filters() {
        let pkts = (0..6u64).map(|i| (i * 1000, udp_bytes())).collect();
        let src = MemorySource::new(pkts, LinkType::Ethernet);
        let mut tap = TapReader::new(Box::new(src), Box::new(EveryNthSampler::new(2)), None);
        let (mut prod, mut cons) = PacketRing::with_defaults(16).split();

        let mut queued = 0;
        while !matches!(tap.poll(&mut prod).unwrap(), TapPoll::Exhausted) {
            queued += 1;
        }
        assert_eq!(queued, 6);
        assert_eq!(tap.stats().packets, 3);
        assert_eq!(tap.stats().filtered, 3);
        let mut seen = 0;
        while cons.peek().is_some() {
            cons.release();
            seen += 1;
        }
        assert_eq!(seen, 3);
    }
}
