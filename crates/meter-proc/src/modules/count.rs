//! Basic accounting: packets, volume, first and last packet time.

use meter_common::{split_us, MeterResult, PacketMeta};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt32, "packets"),
    TypeInfo::new(DataType::UInt32, "volume"),
    TypeInfo::new(DataType::UInt32, "first_time"),
    TypeInfo::new(DataType::UInt32, "first_time_us"),
    TypeInfo::new(DataType::UInt32, "last_time"),
    TypeInfo::new(DataType::UInt32, "last_time_us"),
];

#[derive(Debug, Default)]
struct CountState {
    packets: u32,
    bytes: u32,
    first: u64,
    last: u64,
}

/// Packet and byte counter.
pub struct CountModule;

impl MetricModule for CountModule {
    fn name(&self) -> &'static str {
        "count"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, _params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(CountState::default()))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<CountState>() {
            *s = CountState::default();
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
            .downcast_mut::<CountState>()
            .expect("count state");
        if s.packets == 0 {
            s.first = meta.ts;
        }
        s.last = meta.ts;
        s.packets += 1;
        s.bytes = s.bytes.wrapping_add(meta.wire_len);
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<CountState>()
            .expect("count state");
        let (fs, fus) = split_us(s.first);
        let (ls, lus) = split_us(s.last);
        w.put_u32(s.packets);
        w.put_u32(s.bytes);
        w.put_u32(fs);
        w.put_u32(fus);
        w.put_u32(ls);
        w.put_u32(lus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};

    fn meta(ts: u64, len: u32) -> PacketMeta {
        PacketMeta {
            ts,
            wire_len: len,
            cap_len: len,
            ..PacketMeta::default()
        }
    }

    #[test]
    fn test_count_accumulates() {
        let m = CountModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        for (ts, len) in [(1_000_000, 100), (2_000_000, 200), (3_500_000, 300)] {
            m.process_packet(&[], &meta(ts, len), &mut *state).unwrap();
        }
        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        assert_eq!(fields[0].1, Value::UInt(3));
        assert_eq!(fields[1].1, Value::UInt(600));
        assert_eq!(fields[2].1, Value::UInt(1)); // first_time
        assert_eq!(fields[4].1, Value::UInt(3)); // last_time
        assert_eq!(fields[5].1, Value::UInt(500_000)); // last_time_us
    }

    #[test]
    fn test_reset_equals_fresh() {
        let m = CountModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        m.process_packet(&[], &meta(1, 100), &mut *state).unwrap();
        m.reset_flow_rec(&mut *state);

        let fresh = m.init_flow_rec(&ModParams::new()).unwrap();
        let (mut w1, mut w2) = (RecordWriter::new(), RecordWriter::new());
        m.export_data(&*state, &mut w1);
        m.export_data(&*fresh, &mut w2);
        assert_eq!(w1.finish(), w2.finish());
    }
}
