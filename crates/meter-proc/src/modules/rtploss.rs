//! RTP packet loss estimation.
//!
//! Tracks the RTP sequence number space of a flow the way RFC 3550's
//! appendix algorithm does: a short probation for new sources, cycle
//! counting on wrap, and a resync after large jumps. Loss figures are
//! computed from expected vs. received at export time.

use meter_common::{MeterResult, PacketMeta, PktLayer, TransProto};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::UInt32, "packets"),
    TypeInfo::new(DataType::UInt32, "loss_abs"),
    TypeInfo::new(DataType::UInt32, "loss_int"),
    TypeInfo::new(DataType::UInt32, "loss_frac"),
];

const RTP_SEQ_MOD: u32 = 1 << 16;
const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;
const MIN_SEQUENTIAL: u32 = 2;

#[derive(Debug, Default)]
struct RtpLossState {
    cycles: u32,
    base_seq: u32,
    max_seq: u16,
    bad_seq: u32,
    probation: u32,
    received: u32,
    received_prior: u32,
    expected_prior: u32,
    ssrc: u32,
    started: bool,
}

impl RtpLossState {
    fn init_seq(&mut self, seq: u16, ssrc: u32) {
        self.base_seq = seq as u32;
        self.max_seq = seq;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.cycles = 0;
        self.received = 0;
        self.received_prior = 0;
        self.expected_prior = 0;
        self.ssrc = ssrc;
    }

    fn update_seq(&mut self, seq: u16, ssrc: u32) {
        let udelta = seq.wrapping_sub(self.max_seq);

        // a new source is not valid until a couple of packets with
        // sequential numbers have been seen
        if self.probation > 0 {
            if seq == self.max_seq.wrapping_add(1) {
                self.probation -= 1;
                self.max_seq = seq;
                if self.probation == 0 {
                    self.init_seq(seq, ssrc);
                    self.received += 1;
                }
            } else {
                self.probation = MIN_SEQUENTIAL - 1;
                self.max_seq = seq;
            }
            return;
        }

        if udelta < MAX_DROPOUT {
            // in order, possibly with a wrap
            if seq < self.max_seq {
                self.cycles += RTP_SEQ_MOD;
            }
            self.max_seq = seq;
        } else if udelta <= u16::MAX - MAX_MISORDER {
            // large jump: remember and resync if it repeats
            if seq as u32 == self.bad_seq {
                self.init_seq(seq, ssrc);
            } else {
                self.bad_seq = (seq as u32).wrapping_add(1) & (RTP_SEQ_MOD - 1);
                return;
            }
        }
        // duplicates and small misorderings fall through and count
        self.received += 1;
    }

    fn expected(&self) -> u32 {
        (self.cycles + self.max_seq as u32)
            .wrapping_sub(self.base_seq)
            .wrapping_add(1)
    }

    /// Absolute, interval and fractional loss against the current priors.
    fn loss(&self) -> (u32, u32, u32) {
        if self.received == 0 {
            return (0, 0, 0);
        }
        let expected = self.expected();
        let loss_abs = expected.saturating_sub(self.received);
        let expected_int = expected.wrapping_sub(self.expected_prior);
        let received_int = self.received.wrapping_sub(self.received_prior);
        let loss_int = expected_int.saturating_sub(received_int);
        let loss_frac = if expected_int > 0 && loss_int > 0 {
            (loss_int as u64 * 100 / expected_int as u64) as u32
        } else {
            0
        };
        (loss_abs, loss_int, loss_frac)
    }
}

/// RTP sequence-space loss estimator.
pub struct RtpLossModule;

impl MetricModule for RtpLossModule {
    fn name(&self) -> &'static str {
        "rtploss"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, _params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(RtpLossState::default()))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        // sequence tracking survives; the interval priors advance so the
        // next export reports loss relative to this point
        if let Some(s) = state.as_any_mut().downcast_mut::<RtpLossState>() {
            if s.received > 0 {
                s.expected_prior = s.expected();
                s.received_prior = s.received;
            }
        }
    }

    fn process_packet(
        &self,
        pkt: &[u8],
        meta: &PacketMeta,
        state: &mut dyn FlowData,
    ) -> MeterResult<PacketVerdict> {
        if meta.trans != TransProto::Udp {
            return Ok(PacketVerdict::Continue);
        }
        let Some(data) = meta.layer_offs(PktLayer::Data) else {
            return Ok(PacketVerdict::Continue);
        };
        let Some(hdr) = pkt.get(data..data + 12) else {
            return Ok(PacketVerdict::Continue);
        };
        let flags = u16::from_be_bytes([hdr[0], hdr[1]]);
        if (flags >> 14) & 0x3 != 2 {
            return Ok(PacketVerdict::Continue); // not RTP version 2
        }
        let seq = u16::from_be_bytes([hdr[2], hdr[3]]);
        let ssrc = u32::from_be_bytes([hdr[8], hdr[9], hdr[10], hdr[11]]);

        let s = state
            .as_any_mut()
            .downcast_mut::<RtpLossState>()
            .expect("rtploss state");
        // a new or changed source restarts probation
        if !s.started || s.ssrc != ssrc {
            s.started = true;
            s.ssrc = ssrc;
            s.probation = MIN_SEQUENTIAL;
            s.max_seq = seq.wrapping_sub(1);
        }
        s.update_seq(seq, ssrc);
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<RtpLossState>()
            .expect("rtploss state");
        let (loss_abs, loss_int, loss_frac) = s.loss();
        w.put_u32(s.received);
        w.put_u32(loss_abs);
        w.put_u32(loss_int);
        w.put_u32(loss_frac);
    }
}
