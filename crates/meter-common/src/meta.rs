//! Packet metadata handed from the tap to the classifier and processor.

use crate::time::UsecTs;

/// Max number of rules that can match a single packet
pub const MAX_RULES_MATCH: usize = 128;

/// Link layer protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LinkProto {
    /// Unrecognised or absent link header
    #[default]
    Unknown = 0,
    /// Ethernet II (optionally VLAN tagged)
    Ethernet,
    /// BSD loopback / null encapsulation
    Loopback,
}

/// Network layer protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NetProto {
    /// Unrecognised network layer
    #[default]
    Unknown = 0,
    /// IPv4
    Ip,
    /// IPv6
    Ip6,
}

/// Transport layer protocols (IP protocol numbers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransProto {
    /// Unrecognised transport
    #[default]
    Unknown = 0,
    /// ICMP
    Icmp = 1,
    /// TCP
    Tcp = 6,
    /// UDP
    Udp = 17,
    /// ICMPv6
    Icmp6 = 58,
}

/// Index into the per-layer offset array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PktLayer {
    /// Link header (MAC)
    Link = 0,
    /// Network header (IP)
    Net = 1,
    /// Transport header
    Trans = 2,
    /// Payload
    Data = 3,
}

/// Offset value for a layer the parser did not reach
pub const OFFS_UNSET: i32 = -1;

/// Per-packet metadata stamped by the tap and filled in by the classifier.
#[derive(Debug, Clone)]
pub struct PacketMeta {
    /// Capture timestamp, epoch microseconds
    pub ts: UsecTs,
    /// Original packet length on the wire
    pub wire_len: u32,
    /// Captured length (min of snaplen and wire length)
    pub cap_len: u32,
    /// Byte offsets of link/net/trans/data headers within the captured
    /// bytes; -1 for layers the parser did not reach
    pub offs: [i32; 4],
    /// Link layer protocol
    pub link: LinkProto,
    /// Network layer protocol
    pub net: NetProto,
    /// Transport layer protocol
    pub trans: TransProto,
    /// Set when the packet matched a rule through its reverse filters
    pub reverse: bool,
    /// Number of valid entries in `matches`
    pub match_cnt: u16,
    /// Ids of the rules this packet matched
    pub matches: [u32; MAX_RULES_MATCH],
}

impl Default for PacketMeta {
    fn default() -> Self {
        Self {
            ts: 0,
            wire_len: 0,
            cap_len: 0,
            offs: [OFFS_UNSET; 4],
            link: LinkProto::Unknown,
            net: NetProto::Unknown,
            trans: TransProto::Unknown,
            reverse: false,
            match_cnt: 0,
            matches: [0; MAX_RULES_MATCH],
        }
    }
}

impl PacketMeta {
    /// Offset of a layer, or None when the parser did not reach it.
    #[inline(always)]
    pub fn layer_offs(&self, layer: PktLayer) -> Option<usize> {
        let o = self.offs[layer as usize];
        (o >= 0).then_some(o as usize)
    }

    /// Clear the match list before reclassification.
    #[inline]
    pub fn clear_matches(&mut self) {
        self.match_cnt = 0;
        self.reverse = false;
    }

    /// Record a matching rule id. Returns false when the match list is full.
    #[inline]
    pub fn push_match(&mut self, rid: u32) -> bool {
        if (self.match_cnt as usize) >= MAX_RULES_MATCH {
            return false;
        }
        self.matches[self.match_cnt as usize] = rid;
        self.match_cnt += 1;
        true
    }

    /// The valid prefix of the match list.
    #[inline]
    pub fn match_ids(&self) -> &[u32] {
        &self.matches[..self.match_cnt as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_list_bounds() {
        let mut meta = PacketMeta::default();
        for i in 0..MAX_RULES_MATCH {
            assert!(meta.push_match(i as u32));
        }
        assert!(!meta.push_match(9999));
        assert_eq!(meta.match_ids().len(), MAX_RULES_MATCH);
    }

    #[test]
    fn test_layer_offs_sentinel() {
        let mut meta = PacketMeta::default();
        assert_eq!(meta.layer_offs(PktLayer::Trans), None);
        meta.offs[PktLayer::Trans as usize] = 34;
        assert_eq!(meta.layer_offs(PktLayer::Trans), Some(34));
    }
}
