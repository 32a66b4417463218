//! Property tests for the packet ring's accounting.

use meter_dataplane::PacketRing;
use meter_common::PacketMeta;
use proptest::prelude::*;

proptest! {
    /// Bytes reserved minus bytes released always equals used_memory,
    /// and draining the ring always returns it to empty.
    #[test]
    fn accounting_balances(ops in prop::collection::vec(any::<(bool, u8)>(), 1..400)) {
        let (mut prod, mut cons) = PacketRing::new(16, 128, 64).split();
        let mut queued = 0usize;
        for (push, size) in ops {
            if push {
                if let Some(r) = prod.reserve() {
                    let used = 1 + (size as usize) % 128;
                    r.commit(PacketMeta::default(), used);
                    queued += 1;
                }
            } else if queued > 0 {
                if let Some(p) = cons.peek() {
                    p.release();
                    queued -= 1;
                }
            }
        }
        while cons.peek().is_some() {
            cons.release();
        }
        let st = cons.stats();
        prop_assert_eq!(st.used_buffers, 0);
        prop_assert_eq!(st.used_memory, 0);
    }

    /// Every successful reservation exposes the full guarantee.
    #[test]
    fn reservation_never_shrinks(sizes in prop::collection::vec(1usize..100, 1..64)) {
        let (mut prod, mut cons) = PacketRing::new(8, 100, 80).split();
        for used in sizes {
            match prod.reserve() {
                Some(mut r) => {
                    prop_assert_eq!(r.buf().len(), 100);
                    r.commit(PacketMeta::default(), used);
                }
                None => {
                    if let Some(p) = cons.peek() {
                        p.release();
                    }
                }
            }
        }
    }
}
