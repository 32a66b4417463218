//! Per-direction flow statistics with TCP connection tracking.
//!
//! Counts packets, bytes and PSH/URG flags separately for the forward and
//! backward path of a bidirectional flow and watches the TCP handshake
//! teardown: once both directions have sent FIN and the closing ACK is
//! seen (or a RST appears), the flow is reported as closed and the module
//! requests immediate export.

use meter_common::{MeterResult, PacketMeta, PktLayer, TransProto};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt32, "total_fpackets"),
    TypeInfo::new(DataType::UInt32, "total_fvolume"),
    TypeInfo::new(DataType::UInt32, "total_bpackets"),
    TypeInfo::new(DataType::UInt32, "total_bvolume"),
    TypeInfo::new(DataType::UInt32, "fpsh_cnt"),
    TypeInfo::new(DataType::UInt32, "bpsh_cnt"),
    TypeInfo::new(DataType::UInt32, "furg_cnt"),
    TypeInfo::new(DataType::UInt32, "burg_cnt"),
    TypeInfo::new(DataType::UInt64, "duration"),
    TypeInfo::new(DataType::UInt8, "closed"),
];

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;
const TCP_URG: u8 = 0x20;

#[derive(Debug, Default)]
struct DirStats {
    packets: u32,
    bytes: u32,
    psh: u32,
    urg: u32,
    fin_seen: bool,
}

#[derive(Debug, Default)]
struct FlowStatsState {
    fwd: DirStats,
    back: DirStats,
    first: u64,
    last: u64,
    closed: bool,
}

/// Bidirectional flow statistics.
pub struct FlowStatsModule;

impl MetricModule for FlowStatsModule {
    fn name(&self) -> &'static str {
        "flowstats"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, _params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(FlowStatsState::default()))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<FlowStatsState>() {
            // TCP tracking survives the interval reset; only the
            // accumulators are zeroed
            let fwd_fin = s.fwd.fin_seen;
            let back_fin = s.back.fin_seen;
            let closed = s.closed;
            *s = FlowStatsState::default();
            s.fwd.fin_seen = fwd_fin;
            s.back.fin_seen = back_fin;
            s.closed = closed;
        }
    }

    fn process_packet(
        &self,
        pkt: &[u8],
        meta: &PacketMeta,
        state: &mut dyn FlowData,
    ) -> MeterResult<PacketVerdict> {
        let s = state
            .as_any_mut()
            .downcast_mut::<FlowStatsState>()
            .expect("flowstats state");

        if s.first == 0 {
            s.first = meta.ts;
        }
        s.last = meta.ts;

        let flags = if meta.trans == TransProto::Tcp {
            meta.layer_offs(PktLayer::Trans)
                .and_then(|t| pkt.get(t + 13))
                .copied()
                .unwrap_or(0)
        } else {
            0
        };

        let (dir, other_fin) = if meta.reverse {
            (&mut s.back, s.fwd.fin_seen)
        } else {
            (&mut s.fwd, s.back.fin_seen)
        };
        dir.packets += 1;
        dir.bytes = dir.bytes.wrapping_add(meta.wire_len);
        if flags & TCP_PSH != 0 {
            dir.psh += 1;
        }
        if flags & TCP_URG != 0 {
            dir.urg += 1;
        }
        if flags & TCP_FIN != 0 {
            dir.fin_seen = true;
        }

        // connection teardown: both directions FINed and the closing ACK
        // arrived, or a reset killed the connection outright
        if !s.closed && meta.trans == TransProto::Tcp {
            let both_fins = (s.fwd.fin_seen && s.back.fin_seen)
                || (other_fin && flags & TCP_FIN != 0);
            if flags & TCP_RST != 0 || (both_fins && flags & TCP_ACK != 0 && flags & TCP_SYN == 0)
            {
                s.closed = true;
                return Ok(PacketVerdict::ExportNow);
            }
        }
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<FlowStatsState>()
            .expect("flowstats state");
        w.put_u32(s.fwd.packets);
        w.put_u32(s.fwd.bytes);
        w.put_u32(s.back.packets);
        w.put_u32(s.back.bytes);
        w.put_u32(s.fwd.psh);
        w.put_u32(s.back.psh);
        w.put_u32(s.fwd.urg);
        w.put_u32(s.back.urg);
        w.put_u64(s.last.saturating_sub(s.first));
        w.put_u8(s.closed as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};

    fn tcp_packet(flags: u8, reverse: bool, ts: u64) -> (PacketMeta, Vec<u8>) {
        let mut pkt = vec![0u8; 54];
        pkt[47] = flags; // trans offset 34 + 13
        let mut meta = PacketMeta {
            ts,
            wire_len: 54,
            cap_len: 54,
            reverse,
            trans: TransProto::Tcp,
            ..PacketMeta::default()
        };
        meta.offs = [0, 14, 34, 54];
        (meta, pkt)
    }

    #[test]
    fn test_directional_accounting() {
        let m = FlowStatsModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let (meta, pkt) = tcp_packet(TCP_ACK | TCP_PSH, false, 1);
        m.process_packet(&pkt, &meta, &mut *state).unwrap();
        let (meta, pkt) = tcp_packet(TCP_ACK, true, 2);
        m.process_packet(&pkt, &meta, &mut *state).unwrap();

        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        assert_eq!(fields[0].1, Value::UInt(1)); // fpackets
        assert_eq!(fields[2].1, Value::UInt(1)); // bpackets
        assert_eq!(fields[4].1, Value::UInt(1)); // fpsh
    }

    #[test]
    fn test_fin_exchange_requests_export() {
        let m = FlowStatsModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let handshake = [
            (TCP_SYN, false),
            (TCP_SYN | TCP_ACK, true),
            (TCP_ACK, false),
            (TCP_ACK | TCP_PSH, false), // data
            (TCP_FIN | TCP_ACK, false),
        ];
        for (i, (flags, rev)) in handshake.iter().enumerate() {
            let (meta, pkt) = tcp_packet(*flags, *rev, i as u64 + 1);
            let v = m.process_packet(&pkt, &meta, &mut *state).unwrap();
            assert_eq!(v, PacketVerdict::Continue, "packet {i}");
        }
        // the terminating FIN/ACK from the other side closes the flow
        let (meta, pkt) = tcp_packet(TCP_FIN | TCP_ACK, true, 6);
        let v = m.process_packet(&pkt, &meta, &mut *state).unwrap();
        assert_eq!(v, PacketVerdict::ExportNow);
    }

    #[test]
    fn test_rst_closes_immediately() {
        let m = FlowStatsModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let (meta, pkt) = tcp_packet(TCP_SYN, false, 1);
        m.process_packet(&pkt, &meta, &mut *state).unwrap();
        let (meta, pkt) = tcp_packet(TCP_RST, true, 2);
        let v = m.process_packet(&pkt, &meta, &mut *state).unwrap();
        assert_eq!(v, PacketVerdict::ExportNow);
    }

    #[test]
    fn test_udp_never_closes() {
        let m = FlowStatsModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let (mut meta, pkt) = tcp_packet(0, false, 1);
        meta.trans = TransProto::Udp;
        let v = m.process_packet(&pkt, &meta, &mut *state).unwrap();
        assert_eq!(v, PacketVerdict::Continue);
    }
}
