//! Capture-side dataplane: ring buffer, sources, parser, sampler, tap.
//!
//! ```text
//! PacketSource → TapReader (parse + sample + stamp) → PacketRing
//! ```
//!
//! The ring decouples capture from classification with a bounded, lossy
//! single-producer/single-consumer queue; everything upstream of it runs
//! on the capture path and must never block.

pub mod parse;
pub mod ring;
pub mod sampler;
pub mod source;
pub mod tap;

pub use parse::{parse_layers, LinkType};
pub use ring::{PacketRing, QueuedPacket, RingConsumer, RingProducer, RingStats};
pub use sampler::{EveryNthSampler, ProbabilisticSampler, SampleAll, Sampler};
pub use source::{
    ErfFileSource, MemorySource, NullSource, PacketSource, PcapFileSource, RawCapture,
};
pub use tap::{TapPoll, TapReader, TapStats};
