//! Packet length distribution: min, max and mean wire length.

use meter_common::{MeterResult, PacketMeta};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt16, "minlen"),
    TypeInfo::new(DataType::UInt16, "maxlen"),
    TypeInfo::new(DataType::UInt16, "avglen"),
];

#[derive(Debug, Default)]
struct PktLenState {
    min: u16,
    max: u16,
    packets: u64,
    bytes: u64,
}

/// Packet length min/max/mean.
pub struct PktLenModule;

impl MetricModule for PktLenModule {
    fn name(&self) -> &'static str {
        "pktlen"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, _params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(PktLenState::default()))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<PktLenState>() {
            *s = PktLenState::default();
        }
    }

    fn process_packet(
        &self,
        _pkt: &[u8],
        meta: &PacketMeta,
        state: &mut dyn FlowData,
    ) -> MeterResult<PacketVerdict> {
        let s = state
            .as_any_mut()
            .downcast_mut::<PktLenState>()
            .expect("pktlen state");
        let len = meta.wire_len.min(u16::MAX as u32) as u16;
        if s.packets == 0 {
            s.min = len;
            s.max = len;
        } else {
            if len < s.min {
                s.min = len;
            }
            if len > s.max {
                s.max = len;
            }
        }
        s.packets += 1;
        s.bytes += meta.wire_len as u64;
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<PktLenState>()
            .expect("pktlen state");
        let avg = if s.packets > 0 {
            (s.bytes / s.packets) as u16
        } else {
            0
        };
        w.put_u16(s.min);
        w.put_u16(s.max);
        w.put_u16(avg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};

    fn meta(len: u32) -> PacketMeta {
        PacketMeta {
            wire_len: len,
            cap_len: len,
            ..PacketMeta::default()
        }
    }

    #[test]
    fn test_min_max_avg() {
        let m = PktLenModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        for len in [100, 300, 200] {
            m.process_packet(&[], &meta(len), &mut *state).unwrap();
        }
        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        assert_eq!(fields[0].1, Value::UInt(100));
        assert_eq!(fields[1].1, Value::UInt(300));
        assert_eq!(fields[2].1, Value::UInt(200));
    }
}
