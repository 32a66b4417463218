//! Clock seam for live and offline operation.
//!
//! Live runs read the system clock; trace-file runs drive a monotonic clock
//! from packet timestamps so that event scheduling follows trace time
//! instead of wall time.

use std::sync::atomic::{AtomicU64, Ordering};

/// Microseconds since the Unix epoch.
pub type UsecTs = u64;

/// Microseconds per second.
pub const USECS_PER_SEC: u64 = 1_000_000;

/// Time source consulted by the scheduler and the components.
pub trait Clock: Send + Sync {
    /// Current time in epoch microseconds.
    fn now_us(&self) -> UsecTs;
}

/// Wall-clock time source for live capture.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_us(&self) -> UsecTs {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Monotonic clock driven by trace-file packet timestamps.
///
/// `advance` accepts a timestamp only if it does not move the clock
/// backwards; a rejected timestamp means the packet must be dropped
/// (reordering policy: drop).
#[derive(Debug, Default)]
pub struct TraceClock {
    now: AtomicU64,
}

impl TraceClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock to `ts`. Returns false if `ts` is in the past.
    pub fn advance(&self, ts: UsecTs) -> bool {
        let mut cur = self.now.load(Ordering::Acquire);
        loop {
            if ts < cur {
                return false;
            }
            match self
                .now
                .compare_exchange_weak(cur, ts, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(c) => cur = c,
            }
        }
    }
}

impl Clock for TraceClock {
    #[inline]
    fn now_us(&self) -> UsecTs {
        self.now.load(Ordering::Acquire)
    }
}

/// Next interval boundary strictly after `now`.
///
/// Aligned intervals snap to wall-clock multiples of the interval (an
/// export every 1s aligned from 12:00:00.250 fires at 12:00:01.000, not
/// 12:00:01.250); unaligned intervals fire `interval` after `now`.
pub fn next_interval_boundary(now: UsecTs, interval_us: u64, align: bool) -> UsecTs {
    if align && interval_us > 0 {
        (now / interval_us + 1) * interval_us
    } else {
        now + interval_us
    }
}

/// Seconds and microseconds split of a µs timestamp, for export records.
#[inline]
pub fn split_us(ts: UsecTs) -> (u32, u32) {
    ((ts / USECS_PER_SEC) as u32, (ts % USECS_PER_SEC) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_clock_rejects_reordering() {
        let clock = TraceClock::new();
        assert!(clock.advance(1_000_000));
        assert!(clock.advance(1_000_000)); // equal is fine
        assert!(!clock.advance(999_999));
        assert_eq!(clock.now_us(), 1_000_000);
    }

    #[test]
    fn test_aligned_boundary() {
        // 12:00:00.250 with a 1s aligned interval -> 12:00:01.000
        let now = 43_200 * USECS_PER_SEC + 250_000;
        let next = next_interval_boundary(now, USECS_PER_SEC, true);
        assert_eq!(next, 43_201 * USECS_PER_SEC);
        // unaligned keeps the offset
        let next = next_interval_boundary(now, USECS_PER_SEC, false);
        assert_eq!(next, now + USECS_PER_SEC);
    }

    #[test]
    fn test_aligned_boundary_is_strictly_later() {
        let now = 10 * USECS_PER_SEC;
        assert_eq!(
            next_interval_boundary(now, USECS_PER_SEC, true),
            11 * USECS_PER_SEC
        );
    }

    #[test]
    fn test_split_us() {
        let (s, us) = split_us(5 * USECS_PER_SEC + 123);
        assert_eq!((s, us), (5, 123));
    }
}
