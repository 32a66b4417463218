//! Round-trip time from ICMP echo exchanges.
//!
//! Remembers outstanding echo requests by (id, sequence) and, when the
//! matching reply arrives, accounts the round-trip time into min/avg/max.

use std::collections::VecDeque;

use meter_common::{split_us, MeterResult, PacketMeta, PktLayer, TransProto, UsecTs};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt32, "matches"),
    TypeInfo::new(DataType::UInt32, "min"),
    TypeInfo::new(DataType::UInt32, "min_us"),
    TypeInfo::new(DataType::UInt32, "max"),
    TypeInfo::new(DataType::UInt32, "max_us"),
    TypeInfo::new(DataType::UInt32, "avg"),
    TypeInfo::new(DataType::UInt32, "avg_us"),
];

/// Outstanding echo requests remembered per flow
const PENDING_ENTRIES: usize = 32;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP6_ECHO_REQUEST: u8 = 128;
const ICMP6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy)]
struct Pending {
    id: u16,
    seq: u16,
    ts: UsecTs,
}

#[derive(Debug, Default)]
struct RttState {
    pending: VecDeque<Pending>,
    matches: u32,
    min: u64,
    max: u64,
    sum: u64,
}

/// ICMP echo round-trip times.
pub struct RttPingModule;

impl MetricModule for RttPingModule {
    fn name(&self) -> &'static str {
        "rtt_ping"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, _params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(RttState {
            min: u64::MAX,
            ..RttState::default()
        }))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<RttState>() {
            // requests still in flight survive the interval reset
            s.matches = 0;
            s.min = u64::MAX;
            s.max = 0;
            s.sum = 0;
        }
    }

    fn process_packet(
        &self,
        pkt: &[u8],
        meta: &PacketMeta,
        state: &mut dyn FlowData,
    ) -> MeterResult<PacketVerdict> {
        let (req, rep) = match meta.trans {
            TransProto::Icmp => (ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
            TransProto::Icmp6 => (ICMP6_ECHO_REQUEST, ICMP6_ECHO_REPLY),
            _ => return Ok(PacketVerdict::Continue),
        };
        let Some(trans) = meta.layer_offs(PktLayer::Trans) else {
            return Ok(PacketVerdict::Continue);
        };
        let Some(hdr) = pkt.get(trans..trans + 8) else {
            return Ok(PacketVerdict::Continue);
        };
        let (ty, code) = (hdr[0], hdr[1]);
        if code != 0 {
            return Ok(PacketVerdict::Continue); // no "unreachable" replies
        }
        let id = u16::from_be_bytes([hdr[4], hdr[5]]);
        let seq = u16::from_be_bytes([hdr[6], hdr[7]]);

        let s = state
            .as_any_mut()
            .downcast_mut::<RttState>()
            .expect("rtt state");
        if ty == req {
            if s.pending.len() >= PENDING_ENTRIES {
                s.pending.pop_front();
            }
            s.pending.push_back(Pending {
                id,
                seq,
                ts: meta.ts,
            });
        } else if ty == rep {
            if let Some(pos) = s.pending.iter().position(|p| p.id == id && p.seq == seq) {
                let sent = s.pending.remove(pos).expect("position just found");
                let rtt = meta.ts.saturating_sub(sent.ts);
                if rtt < s.min {
                    s.min = rtt;
                }
                if rtt > s.max {
                    s.max = rtt;
                }
                s.sum += rtt;
                s.matches += 1;
            }
        }
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<RttState>()
            .expect("rtt state");
        let min = if s.matches > 0 { s.min } else { 0 };
        let avg = if s.matches > 0 {
            s.sum / s.matches as u64
        } else {
            0
        };
        let (min_s, min_us) = split_us(min);
        let (max_s, max_us) = split_us(s.max);
        let (avg_s, avg_us) = split_us(avg);
        w.put_u32(s.matches);
        w.put_u32(min_s);
        w.put_u32(min_us);
        w.put_u32(max_s);
        w.put_u32(max_us);
        w.put_u32(avg_s);
        w.put_u32(avg_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};

    fn icmp_packet(ty: u8, id: u16, seq: u16, ts: UsecTs) -> (PacketMeta, Vec<u8>) {
        let mut pkt = vec![0u8; 60];
        let t = 34usize;
        pkt[t] = ty;
        pkt[t + 4..t + 6].copy_from_slice(&id.to_be_bytes());
        pkt[t + 6..t + 8].copy_from_slice(&seq.to_be_bytes());
        let mut meta = PacketMeta {
            ts,
            wire_len: 60,
            cap_len: 60,
            trans: TransProto::Icmp,
            ..PacketMeta::default()
        };
        meta.offs = [0, 14, 34, 42];
        (meta, pkt)
    }

    fn export(m: &RttPingModule, state: &dyn FlowData) -> Vec<(String, Value)> {
        let mut w = RecordWriter::new();
        m.export_data(state, &mut w);
        decode_record(SCHEMA, &w.finish()).unwrap()
    }

    #[test]
    fn test_request_reply_pairing() {
        let m = RttPingModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        // two exchanges: 20ms and 1.5s round trips
        for (ty, id, seq, ts) in [
            (ICMP_ECHO_REQUEST, 7, 1, 1_000_000),
            (ICMP_ECHO_REPLY, 7, 1, 1_020_000),
            (ICMP_ECHO_REQUEST, 7, 2, 2_000_000),
            (ICMP_ECHO_REPLY, 7, 2, 3_500_000),
        ] {
            let (meta, pkt) = icmp_packet(ty, id, seq, ts);
            m.process_packet(&pkt, &meta, &mut *state).unwrap();
        }
        let fields = export(&m, &*state);
        assert_eq!(fields[0].1, Value::UInt(2)); // matches
        assert_eq!(fields[1].1, Value::UInt(0)); // min s
        assert_eq!(fields[2].1, Value::UInt(20_000)); // min us
        assert_eq!(fields[3].1, Value::UInt(1)); // max s
        assert_eq!(fields[4].1, Value::UInt(500_000)); // max us
    }

    #[test]
    fn test_unmatched_reply_ignored() {
        let m = RttPingModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let (meta, pkt) = icmp_packet(ICMP_ECHO_REPLY, 9, 9, 1_000_000);
        m.process_packet(&pkt, &meta, &mut *state).unwrap();
        let fields = export(&m, &*state);
        assert_eq!(fields[0].1, Value::UInt(0));
    }

    #[test]
    fn test_non_icmp_ignored() {
        let m = RttPingModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let (mut meta, pkt) = icmp_packet(ICMP_ECHO_REQUEST, 1, 1, 1);
        meta.trans = TransProto::Udp;
        m.process_packet(&pkt, &meta, &mut *state).unwrap();
        let fields = export(&m, &*state);
        assert_eq!(fields[0].1, Value::UInt(0));
        let s = (&*state).as_any().downcast_ref::<RttState>().unwrap();
        assert!(s.pending.is_empty());
    }
}
