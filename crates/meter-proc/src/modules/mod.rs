//! Built-in metric modules.

pub mod bandwidth;
pub mod count;
pub mod flowstats;
pub mod jitter;
pub mod pktid;
pub mod pktid_crc32;
pub mod pktid_sha;
pub mod pktlen;
pub mod port_use;
pub mod rtploss;
pub mod rtt_ping;
