//! Packet inter-arrival time statistics.
//!
//! Tracks min/avg/max and variance of the gaps between consecutive
//! packets of a flow. The first packet only arms the timestamp; gap
//! counters start with the second.

use meter_common::{MeterResult, PacketMeta};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt32, "packets"),
    TypeInfo::new(DataType::UInt64, "diff_min"),
    TypeInfo::new(DataType::UInt64, "diff_avg"),
    TypeInfo::new(DataType::UInt64, "diff_max"),
    TypeInfo::new(DataType::UInt64, "diff_var"),
];

#[derive(Debug, Default)]
struct JitterState {
    first: u64,
    last: u64,
    min: u64,
    max: u64,
    sum: u64,
    sqr_sum: u64,
    /// Number of measured gaps
    packets: u32,
}

/// Inter-arrival time distribution.
pub struct JitterModule;

impl MetricModule for JitterModule {
    fn name(&self) -> &'static str {
        "jitter"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, _params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(JitterState {
            min: u64::MAX,
            ..JitterState::default()
        }))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<JitterState>() {
            *s = JitterState {
                min: u64::MAX,
                ..JitterState::default()
            };
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
            .downcast_mut::<JitterState>()
            .expect("jitter state");
        if s.first == 0 {
            s.first = meta.ts;
        } else {
            let diff = meta.ts.saturating_sub(s.last);
            if diff < s.min {
                s.min = diff;
            }
            if diff > s.max {
                s.max = diff;
            }
            s.sum += diff;
            s.sqr_sum = s.sqr_sum.wrapping_add(diff.wrapping_mul(diff));
            s.packets += 1;
        }
        s.last = meta.ts;
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<JitterState>()
            .expect("jitter state");
        let n = s.packets as u64;
        let (avg, var) = if n > 0 {
            let avg = s.sum / n;
            (avg, (s.sqr_sum / n).saturating_sub(avg * avg))
        } else {
            (0, 0)
        };
        w.put_u32(s.packets);
        w.put_u64(if s.packets > 0 { s.min } else { 0 });
        w.put_u64(avg);
        w.put_u64(s.max);
        w.put_u64(var);
    }
}
