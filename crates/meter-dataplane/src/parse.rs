//! L2/L3/L4 header parsing.
//!
//! Fills the per-layer protocol tags and byte offsets of a packet's
//! metadata. Layers the parser cannot reach keep the -1 sentinel so that
//! filters anchored there never match.

use meter_common::{LinkProto, NetProto, PacketMeta, PktLayer, TransProto};
use tracing::warn;

/// Link encapsulation of a capture source (pcap DLT values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II, optionally 802.1Q tagged
    Ethernet,
    /// BSD null/loopback: 4-byte address family
    Null,
    /// Raw IP, no link header
    Raw,
}

impl LinkType {
    /// Map a pcap link-layer header type.
    pub fn from_dlt(dlt: u32) -> Option<Self> {
        match dlt {
            0 => Some(LinkType::Null),
            1 => Some(LinkType::Ethernet),
            12 | 14 | 101 => Some(LinkType::Raw),
            _ => None,
        }
    }
}

const ETHERTYPE_IP: u16 = 0x0800;
const ETHERTYPE_IP6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

const IP6_HLEN: usize = 40;
// extension headers skipped on the way to the transport header
const IP6HDR_HOP: u8 = 0;
const IP6HDR_ROUTE: u8 = 43;
const IP6HDR_FRAG: u8 = 44;
const IP6HDR_AH: u8 = 51;
const IP6HDR_DEST: u8 = 60;

const ICMP_HLEN: usize = 8;
const ICMP6_HLEN: usize = 4;
const UDP_HLEN: usize = 8;

#[inline]
fn be16(p: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*p.get(off)?, *p.get(off + 1)?]))
}

/// Parse layer offsets and protocol tags into `meta`.
///
/// Stops quietly at the first unrecognised layer; offsets beyond it stay
/// at the sentinel.
pub fn parse_layers(meta: &mut PacketMeta, payload: &[u8], link: LinkType) {
    let cap = meta.cap_len as usize;
    let payload = &payload[..cap.min(payload.len())];
    let mut offs = 0usize;
    let net_type;

    meta.offs = [-1; 4];
    meta.offs[PktLayer::Link as usize] = 0;

    match link {
        LinkType::Ethernet => {
            meta.link = LinkProto::Ethernet;
            let Some(mut ethertype) = be16(payload, 12) else {
                return;
            };
            offs += 14;
            if ethertype == ETHERTYPE_VLAN {
                let Some(tci) = be16(payload, 14) else {
                    return;
                };
                if tci & 0x1000 != 0 {
                    warn!("unsupported ethertype: VLAN with options (CFI=1)");
                }
                // one 802.1Q tag: the real ethertype sits four bytes later
                let Some(inner) = be16(payload, 16) else {
                    return;
                };
                ethertype = inner;
                offs += 4;
            }
            net_type = ethertype;
        }
        LinkType::Null => {
            meta.link = LinkProto::Loopback;
            if payload.len() < 4 {
                return;
            }
            // address family in capturing-host byte order
            let af = u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
            let af = if af > 0xFFFF { af.swap_bytes() } else { af };
            net_type = match af {
                2 => ETHERTYPE_IP,
                10 | 24 | 28 | 30 => ETHERTYPE_IP6,
                _ => 0,
            };
            offs += 4;
        }
        LinkType::Raw => {
            meta.link = LinkProto::Unknown;
            net_type = match payload.first().map(|b| b >> 4) {
                Some(4) => ETHERTYPE_IP,
                Some(6) => ETHERTYPE_IP6,
                _ => 0,
            };
        }
    }

    if offs >= payload.len() {
        return;
    }
    meta.offs[PktLayer::Net as usize] = offs as i32;
    let net_off = offs;

    let proto;
    match net_type {
        ETHERTYPE_IP => {
            meta.net = NetProto::Ip;
            let Some(&ihl) = payload.get(net_off) else {
                return;
            };
            offs += ((ihl & 0x0f) as usize) << 2;
            proto = match payload.get(net_off + 9) {
                Some(&p) => p,
                None => return,
            };
        }
        ETHERTYPE_IP6 => {
            meta.net = NetProto::Ip6;
            let Some(&nh) = payload.get(net_off + 6) else {
                return;
            };
            offs += IP6_HLEN;
            let mut next = nh;
            // skip hop-by-hop, routing, fragment, destination and AH
            // extension headers; length units differ for AH
            let mut hops = 0;
            while matches!(
                next,
                IP6HDR_HOP | IP6HDR_ROUTE | IP6HDR_FRAG | IP6HDR_DEST | IP6HDR_AH
            ) {
                let Some(&ext_len) = payload.get(offs + 1) else {
                    return;
                };
                let Some(&nh) = payload.get(offs) else {
                    return;
                };
                offs += if next == IP6HDR_AH {
                    ext_len as usize * 4 + 8
                } else {
                    ext_len as usize * 8 + 8
                };
                next = nh;
                hops += 1;
                if hops > 16 || offs >= payload.len() {
                    return;
                }
            }
            proto = next;
        }
        _ => {
            meta.net = NetProto::Unknown;
            return;
        }
    }

    if offs >= payload.len() {
        return;
    }
    meta.offs[PktLayer::Trans as usize] = offs as i32;
    let trans_off = offs;

    match proto {
        1 => {
            meta.trans = TransProto::Icmp;
            offs += ICMP_HLEN;
        }
        58 => {
            meta.trans = TransProto::Icmp6;
            offs += ICMP6_HLEN;
        }
        17 => {
            meta.trans = TransProto::Udp;
            offs += UDP_HLEN;
        }
        6 => {
            meta.trans = TransProto::Tcp;
            let Some(&doff) = payload.get(trans_off + 12) else {
                return;
            };
            offs += ((doff & 0xf0) >> 2) as usize;
        }
        _ => {
            meta.trans = TransProto::Unknown;
            return;
        }
    }

    if offs < payload.len() {
        meta.offs[PktLayer::Data as usize] = offs as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_ipv4_udp() -> Vec<u8> {
        let mut p = vec![0u8; 60];
        p[12] = 0x08;
        p[13] = 0x00;
        p[14] = 0x45;
        p[23] = 17;
        p
    }

    fn meta_for(p: &[u8]) -> PacketMeta {
        PacketMeta {
            cap_len: p.len() as u32,
            wire_len: p.len() as u32,
            ..PacketMeta::default()
        }
    }

    #[test]
    fn test_ethernet_ipv4_udp() {
        let p = eth_ipv4_udp();
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.offs, [0, 14, 34, 42]);
        assert_eq!(m.net, NetProto::Ip);
        assert_eq!(m.trans, TransProto::Udp);
    }

    #[test]
    fn test_vlan_tag_shifts_network_layer() {
        let mut p = vec![0u8; 64];
        p[12] = 0x81;
        p[13] = 0x00;
        // priority tag, inner type IPv4
        p[16] = 0x08;
        p[17] = 0x00;
        p[18] = 0x45;
        p[27] = 17;
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.offs[1], 18);
        assert_eq!(m.offs[2], 38);
        assert_eq!(m.trans, TransProto::Udp);
    }

    #[test]
    fn test_tcp_data_offset() {
        let mut p = eth_ipv4_udp();
        p[23] = 6;
        p[46] = 0x60; // 24-byte TCP header (options)
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.trans, TransProto::Tcp);
        assert_eq!(m.offs[3], 34 + 24);
    }

    #[test]
    fn test_ipv6_extension_headers_skipped() {
        // ethernet + ipv6 + hop-by-hop(8) + dest(16) + udp
        let mut p = vec![0u8; 14 + 40 + 8 + 16 + 8 + 4];
        p[12] = 0x86;
        p[13] = 0xdd;
        p[14] = 0x60;
        p[20] = IP6HDR_HOP; // next header
        let hop = 14 + 40;
        p[hop] = IP6HDR_DEST;
        p[hop + 1] = 0; // 8 bytes
        let dest = hop + 8;
        p[dest] = 17; // UDP
        p[dest + 1] = 1; // 16 bytes
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.net, NetProto::Ip6);
        assert_eq!(m.trans, TransProto::Udp);
        assert_eq!(m.offs[2] as usize, dest + 16);
    }

    #[test]
    fn test_ipv6_ah_units() {
        // AH length counts 4-byte units (len 1 -> 12 bytes total)
        let mut p = vec![0u8; 14 + 40 + 12 + 8 + 4];
        p[12] = 0x86;
        p[13] = 0xdd;
        p[20] = IP6HDR_AH;
        let ah = 14 + 40;
        p[ah] = 17;
        p[ah + 1] = 1;
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.trans, TransProto::Udp);
        assert_eq!(m.offs[2] as usize, ah + 12);
    }

    #[test]
    fn test_unknown_transport_leaves_sentinel() {
        let mut p = eth_ipv4_udp();
        p[23] = 47; // GRE
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.offs[2], 34);
        assert_eq!(m.offs[3], -1);
        assert_eq!(m.trans, TransProto::Unknown);
    }

    #[test]
    fn test_raw_ip() {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[9] = 17;
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Raw);
        assert_eq!(m.offs[1], 0);
        assert_eq!(m.offs[2], 20);
    }

    #[test]
    fn test_truncated_packet_does_not_panic() {
        let p = vec![0x08u8; 10];
        let mut m = meta_for(&p);
        parse_layers(&mut m, &p, LinkType::Ethernet);
        assert_eq!(m.offs[1], -1);
    }
}
