//! Per-packet identifiers from a truncated SHA-256 digest.
//!
//! Same event stream as the CRC generator but with a cryptographic hash
//! over the packet head, for deployments where id collisions across
//! similar packets matter more than hashing cost.

use meter_common::{split_us, MeterResult, PacketMeta, PktLayer};
use sha2::{Digest, Sha256};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::modules::pktid::{PktEvent, PktIdState, HASH_WINDOW, SCHEMA};
use crate::schema::TypeInfo;
use crate::wire::RecordWriter;

/// SHA-256 packet id generator.
pub struct PktIdShaModule;

impl MetricModule for PktIdShaModule {
    fn name(&self) -> &'static str {
        "pktid_sha"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(PktIdState::from_params("pktid_sha", params)?))
    }

    fn reset_flow_rec(&self, state: &mut dyn FlowData) {
        if let Some(s) = state.as_any_mut().downcast_mut::<PktIdState>() {
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
            .downcast_mut::<PktIdState>()
            .expect("pktid state");
        let Some(net) = meta.layer_offs(PktLayer::Net) else {
            return Ok(PacketVerdict::Continue);
        };
        let end = (net + HASH_WINDOW).min(pkt.len());
        let digest = Sha256::digest(&pkt[net..end]);
        let id = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        s.record(PktEvent::from_packet(meta, pkt, id));
        Ok(PacketVerdict::Continue)
    }

    fn export_data(&self, state: &dyn FlowData, w: &mut RecordWriter) {
        let s = state
            .as_any()
            .downcast_ref::<PktIdState>()
            .expect("pktid state");
        s.export(w, split_us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_record, Value};

    #[test]
    fn test_ids_differ_per_packet_content() {
        let m = PktIdShaModule;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        for ttl in [64u8, 63u8] {
            let mut pkt = vec![0u8; 60];
            pkt[14] = 0x45;
            pkt[22] = ttl;
            let mut meta = PacketMeta {
                ts: 1,
                wire_len: 60,
                cap_len: 60,
                ..PacketMeta::default()
            };
            meta.offs = [0, 14, 34, 42];
            m.process_packet(&pkt, &meta, &mut *state).unwrap();
        }
        let mut w = RecordWriter::new();
        m.export_data(&*state, &mut w);
        let fields = decode_record(SCHEMA, &w.finish()).unwrap();
        match &fields[0].1 {
            Value::List(elems) => {
                assert_eq!(elems.len(), 2);
                assert_ne!(elems[0][2], elems[1][2]);
            }
            other => panic!("expected event list, got {other:?}"),
        }
    }
}
