//! Per-destination-port accounting with a top-N report.
//!
//! Counts packets and bytes per TCP/UDP destination port and exports the
//! busiest ports as a repeated group, followed by a rest bucket and an
//! "other" bucket for packets without a TCP/UDP transport header.

use meter_common::{MeterResult, PacketMeta, PktLayer, TransProto};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt64, "all_packets"),
    TypeInfo::new(DataType::UInt64, "all_volume"),
    TypeInfo::new(DataType::UInt64, "other_packets"),
    TypeInfo::new(DataType::UInt64, "other_volume"),
    TypeInfo::new(DataType::List, "port_list"),
    TypeInfo::new(DataType::UInt16, "port"),
    TypeInfo::new(DataType::UInt64, "packets"),
    TypeInfo::new(DataType::UInt64, "volume"),
    TypeInfo::new(DataType::ListEnd, "port_list_end"),
];

const DEFAULT_TOP_N: usize = 10;

struct PortUseState {
    top_n: usize,
    all_packets: u64,
    all_bytes: u64,
    other_packets: u64,
    other_bytes: u64,
    packets: Box<[u64; 65536]>,
    bytes: Box<[u64; 65536]>,
}

impl PortUseState {
    fn new(top_n: usize) -> Self {
        Self {
            top_n,
            all_packets: 0,
            all_bytes: 0,
            other_packets: 0,
            other_bytes: 0,
            packets: vec![0u64; 65536].try_into().expect("fixed size"),
            bytes: vec![0u64; 65536].try_into().expect("fixed size"),
        }
    }

    fn clear(&mut self) {
        self.all_packets = 0;
        self.all_bytes = 0;
        self.other_packets = 0;
        self.other_bytes = 0;
        self.packets.fill(0);
        self.bytes.fill(0);
    }
}

/// Top-N destination port usage.
pub struct PortUseModule;

impl MetricModule for PortUseModule {
    fn name(&self) -> &'static str {
        "port_use"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        let top_n = match params.get("topn") {
            Some(v) => v.parse::<usize>().map_err(|_| {
                meter_common::MeterError::ModuleParams {
                    module: "port_use".into(),
                    reason: format!("topn is not a number: {v}"),
                }
            })?,
            None => DEFAULT_TOP_N,
        };
        Ok(Box::new(PortUseState::new(top_n.clamp(1, 1024))))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<PortUseState>() {
            s.clear();
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
            .downcast_mut::<PortUseState>()
            .expect("port_use state");
        let len = meta.wire_len as u64;
        s.all_packets += 1;
        s.all_bytes += len;

        let dport = match meta.trans {
            TransProto::Tcp | TransProto::Udp => meta
                .layer_offs(PktLayer::Trans)
                .and_then(|t| pkt.get(t + 2..t + 4))
                .map(|b| u16::from_be_bytes([b[0], b[1]])),
            _ => None,
        };
        match dport {
            Some(port) => {
                s.packets[port as usize] += 1;
                s.bytes[port as usize] += len;
            }
            None => {
                s.other_packets += 1;
                s.other_bytes += len;
            }
        }
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<PortUseState>()
            .expect("port_use state");

        let mut ports: Vec<u16> = (0..=65535u16)
            .filter(|&p| s.packets[p as usize] > 0)
            .collect();
        ports.sort_by(|&a, &b| {
            s.packets[b as usize]
                .cmp(&s.packets[a as usize])
                .then(a.cmp(&b))
        });
        ports.truncate(s.top_n);

        w.put_u64(s.all_packets);
        w.put_u64(s.all_bytes);
        w.put_u64(s.other_packets);
        w.put_u64(s.other_bytes);
        w.put_list_count(ports.len() as u32);
        for p in ports {
            w.put_u16(p);
            w.put_u64(s.packets[p as usize]);
            w.put_u64(s.bytes[p as usize]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};

    fn meta_port(port: u16, len: u32) -> (PacketMeta, Vec<u8>) {
        let mut pkt = vec![0u8; 60];
        pkt[36..38].copy_from_slice(&port.to_be_bytes());
        let mut meta = PacketMeta {
            wire_len: len,
            cap_len: 60,
            trans: TransProto::Udp,
            ..PacketMeta::default()
        };
        meta.offs = [0, 14, 34, 42];
        (meta, pkt)
    }

    #[test]
    fn test_top_ports_ranked() {
        let m = PortUseModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        for (port, count) in [(53u16, 3), (80u16, 1), (443u16, 2)] {
            for _ in 0..count {
                let (meta, pkt) = meta_port(port, 100);
                m.process_packet(&pkt, &meta, &mut *state).unwrap();
            }
        }
        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        assert_eq!(fields[0].1, Value::UInt(6)); // all packets
        match &fields[4].1 {
            Value::List(elems) => {
                assert_eq!(elems.len(), 3);
                assert_eq!(elems[0][0], ("port".into(), Value::UInt(53)));
                assert_eq!(elems[0][1], ("packets".into(), Value::UInt(3)));
                assert_eq!(elems[1][0], ("port".into(), Value::UInt(443)));
            }
            other => panic!("expected port list, got {other:?}"),
        }
    }

    #[test]
    fn test_topn_param() {
        let m = PortUseModule;
        let params = ModParams::from([("topn".to_string(), "1".to_string())]);
        let mut state = m.init_flow_rec(&params).unwrap();
        for port in [53u16, 80u16] {
            let (meta, pkt) = meta_port(port, 100);
            m.process_packet(&pkt, &meta, &mut *state).unwrap();
        }
        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        match &fields[4].1 {
            Value::List(elems) => assert_eq!(elems.len(), 1),
            other => panic!("expected port list, got {other:?}"),
        }
        // bad parameter rejected
        let bad = ModParams::from([("topn".to_string(), "many".to_string())]);
        assert!(m.init_flow_rec(&bad).is_err());
    }

    #[test]
    fn test_non_tcp_udp_counts_as_other() {
        let m = PortUseModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        let (mut meta, pkt) = meta_port(53, 100);
        meta.trans = TransProto::Icmp;
        m.process_packet(&pkt, &meta, &mut *state).unwrap();
        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        assert_eq!(fields[2].1, Value::UInt(1)); // other packets
    }
}
