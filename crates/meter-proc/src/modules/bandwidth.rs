//! Interval bandwidth accounting.
//!
//! Accumulates packets and bytes and, when a snapshot interval is
//! configured, registers a recurring per-flow timer that freezes the
//! counters into a list entry with computed packet and byte rates. The
//! export carries all frozen snapshots followed by the still-running
//! interval.

use meter_common::{split_us, MeterError, MeterResult, PacketMeta};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict, TimerSpec};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::List, "counters"),
    TypeInfo::new(DataType::UInt32, "packets"),
    TypeInfo::new(DataType::UInt32, "bytes"),
    TypeInfo::new(DataType::UInt32, "first_time"),
    TypeInfo::new(DataType::UInt32, "first_time_us"),
    TypeInfo::new(DataType::UInt32, "last_time"),
    TypeInfo::new(DataType::UInt32, "last_time_us"),
    TypeInfo::new(DataType::UInt32, "packet_rate"),
    TypeInfo::new(DataType::UInt32, "bandwidth"),
    TypeInfo::new(DataType::ListEnd, "counters_end"),
];

/// Timer handle used for counter snapshots
const SNAPSHOT_TIMER: u32 = 1;

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    packets: u32,
    bytes: u32,
    first: u64,
    last: u64,
    packet_rate: u32,
    bandwidth: u32,
}

#[derive(Debug, Default)]
struct BandwidthState {
    /// Snapshot interval in milliseconds; 0 disables the timer
    interval_ms: u32,
    curr: Counters,
    snapshots: Vec<Counters>,
}

impl BandwidthState {
    fn freeze(&mut self) {
        if self.interval_ms == 0 {
            return;
        }
        // rates over the elapsed snapshot interval
        self.curr.bandwidth = (self.curr.bytes as u64 * 1000 / self.interval_ms as u64) as u32;
        self.curr.packet_rate = (self.curr.packets as u64 * 1000 / self.interval_ms as u64) as u32;
        self.snapshots.push(self.curr);
        self.curr = Counters::default();
    }
}

/// Packet and byte rates per snapshot interval.
pub struct BandwidthModule;

impl MetricModule for BandwidthModule {
    fn name(&self) -> &'static str {
        "bandwidth"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        let interval_ms = match params.get("interval") {
            Some(v) => {
                let secs = v
                    .parse::<u32>()
                    .map_err(|_| MeterError::ModuleParams {
                        module: "bandwidth".into(),
                        reason: format!("interval is not a number: {v}"),
                    })?;
                secs.saturating_mul(1000)
            }
            None => 0,
        };
        Ok(Box::new(BandwidthState {
            interval_ms,
            ..BandwidthState::default()
        }))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<BandwidthState>() {
            s.curr = Counters::default();
            s.snapshots.clear();
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
            .downcast_mut::<BandwidthState>()
            .expect("bandwidth state");
        if s.curr.packets == 0 {
            s.curr.first = meta.ts;
        }
        s.curr.last = meta.ts;
        s.curr.packets += 1;
        s.curr.bytes = s.curr.bytes.wrapping_add(meta.wire_len);
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<BandwidthState>()
            .expect("bandwidth state");
        w.put_list_count(s.snapshots.len() as u32 + 1);
        for c in s.snapshots.iter().chain(std::iter::once(&s.curr)) {
            let (fs, fus) = split_us(c.first);
            let (ls, lus) = split_us(c.last);
            w.put_u32(c.packets);
            w.put_u32(c.bytes);
            w.put_u32(fs);
            w.put_u32(fus);
            w.put_u32(ls);
            w.put_u32(lus);
            w.put_u32(c.packet_rate);
            w.put_u32(c.bandwidth);
        }
    }

    fn get_timers(&self, state: &dyn FlowData) -> Vec<TimerSpec> {
        let s = state
            .as_any()
            .downcast_ref::<BandwidthState>()
            .expect("bandwidth state");
        if s.interval_ms == 0 {
            return Vec::new();
        }
        vec![TimerSpec {
            id: SNAPSHOT_TIMER,
            interval_ms: s.interval_ms,
            recurring: true,
            aligned: false,
        }]
    }

    fn timeout(&self, timer_id: u32, state: &mut dyn FlowData) {
        if timer_id != SNAPSHOT_TIMER {
            return;
        }
        if let Some(s) = state.as_any_mut().downcast_mut::<BandwidthState>() {
            s.freeze();
        }
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

    fn params(interval: &str) -> ModParams {
        ModParams::from([("interval".to_string(), interval.to_string())])
    }

    #[test]
    fn test_snapshot_on_timer() {
        let m = BandwidthModule;
        let mut state = m.init_flow_rec(&params("2")).unwrap();
        assert_eq!(m.get_timers(&*state)[0].interval_ms, 2000);

        // one interval worth of traffic, then the timer fires
        m.process_packet(&[], &meta(1_000_000, 500), &mut *state)
            .unwrap();
        m.process_packet(&[], &meta(2_000_000, 1500), &mut *state)
            .unwrap();
        m.timeout(SNAPSHOT_TIMER, &mut *state);
        m.process_packet(&[], &meta(3_000_000, 100), &mut *state)
            .unwrap();

        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        match &fields[0].1 {
            Value::List(elems) => {
                assert_eq!(elems.len(), 2, "one snapshot plus the open interval");
                assert_eq!(elems[0][0], ("packets".into(), Value::UInt(2)));
                assert_eq!(elems[0][1], ("bytes".into(), Value::UInt(2000)));
                // 2000 bytes over a 2s interval
                assert_eq!(elems[0][7], ("bandwidth".into(), Value::UInt(1000)));
                assert_eq!(elems[1][0], ("packets".into(), Value::UInt(1)));
            }
            other => panic!("expected counter list, got {other:?}"),
        }
    }

    #[test]
    fn test_no_timer_without_interval() {
        let m = BandwidthModule;
        let state = m.init_flow_rec(&ModParams::new()).unwrap();
        assert!(m.get_timers(&*state).is_empty());
        // bad parameter rejected
        assert!(m.init_flow_rec(&params("soon")).is_err());
    }
}
