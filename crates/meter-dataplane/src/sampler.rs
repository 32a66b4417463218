//! Packet sampling.
//!
//! A sampler gates which parsed packets advance into the ring. The
//! default passes everything; probabilistic and 1-in-N samplers cover
//! load shedding on busy taps.

use meter_common::PacketMeta;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides per packet whether it advances through the pipeline.
pub trait Sampler: Send {
    /// True when the packet is sampled.
    fn sample(&mut self, meta: &PacketMeta) -> bool;
}

/// Samples each and every packet.
#[derive(Debug, Default)]
pub struct SampleAll;

impl Sampler for SampleAll {
    #[inline(always)]
    fn sample(&mut self, _meta: &PacketMeta) -> bool {
        true
    }
}

/// Samples packets independently with a fixed probability.
pub struct ProbabilisticSampler {
    prob: f64,
    rng: StdRng,
}

impl ProbabilisticSampler {
    /// Sampler keeping roughly `prob` of the traffic (clamped to [0, 1]).
    pub fn new(prob: f64) -> Self {
        Self {
            prob: prob.clamp(0.0, 1.0),
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn with_seed(prob: f64, seed: u64) -> Self {
        Self {
            prob: prob.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Sampler for ProbabilisticSampler {
    fn sample(&mut self, _meta: &PacketMeta) -> bool {
        self.rng.gen_bool(self.prob)
    }
}

/// Samples every n-th packet.
pub struct EveryNthSampler {
    n: u64,
    seen: u64,
}

impl EveryNthSampler {
    /// Sampler passing one packet out of every `n` (n = 0 acts like 1).
    pub fn new(n: u64) -> Self {
        Self { n: n.max(1), seen: 0 }
    }
}

impl Sampler for EveryNthSampler {
    fn sample(&mut self, _meta: &PacketMeta) -> bool {
        self.seen += 1;
        self.seen % self.n == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_all() {
        let mut s = SampleAll;
        assert!(s.sample(&PacketMeta::default()));
    }

    #[test]
    fn test_every_nth() {
        let mut s = EveryNthSampler::new(3);
        let meta = PacketMeta::default();
        let kept: Vec<bool> = (0..9).map(|_| s.sample(&meta)).collect();
        assert_eq!(kept.iter().filter(|&&k| k).count(), 3);
        assert!(kept[2] && kept[5] && kept[8]);
    }

    #[test]
    fn test_probabilistic_rate() {
        let mut s = ProbabilisticSampler::with_seed(0.25, 7);
        let meta = PacketMeta::default();
        let kept = (0..10_000).filter(|_| s.sample(&meta)).count();
        assert!((2_000..3_000).contains(&kept), "kept {kept} of 10000");
    }
}
