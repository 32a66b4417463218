//! Per-packet identifiers from a CRC-32 over the packet head.
//!
//! For passive one-way-delay measurements every packet gets a compact id:
//! a CRC-32 (polynomial 0x04c11db7) over the network header and the first
//! payload bytes, exported as a list of (timestamp, id, length, tos)
//! events.

use meter_common::{split_us, MeterResult, PacketMeta, PktLayer};

use crate::module::{FlowData, MetricModule, ModParams, PacketVerdict};
use crate::modules::pktid::{PktEvent, PktIdState, HASH_WINDOW, SCHEMA};
use crate::wire::RecordWriter;
use crate::schema::TypeInfo;

use std::sync::OnceLock;

const POLYNOMIAL: u32 = 0x04c1_1db7;
const CRC_INIT: u32 = 0xffff_ffff;

fn crc_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let mut acc = (i as u32) << 24;
            for _ in 0..8 {
                acc = if acc & 0x8000_0000 != 0 {
                    (acc << 1) ^ POLYNOMIAL
                } else {
                    acc << 1
                };
            }
            *slot = acc;
        }
        table
    })
}

fn crc32(data: &[u8]) -> u32 {
    let table = crc_table();
    let mut acc = CRC_INIT;
    for &b in data {
        let i = ((acc >> 24) ^ b as u32) as usize & 0xff;
        acc = (acc << 8) ^ table[i];
    }
    acc
}

/// CRC-32 packet id generator.
pub struct PktIdCrc32Module;

impl MetricModule for PktIdCrc32Module {
    fn name(&self) -> &'static str {
        "pktid_crc32"
    }

    fn schema(&self) -> &'static [TypeInfo] {
        SCHEMA
    }

    fn init_flow_rec(&self, params: &ModParams) -> MeterResult<Box<dyn FlowData>> {
        Ok(Box::new(PktIdState::from_params("pktid_crc32", params)?))
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
        let id = crc32(&pkt[net..end]);
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
    fn test_crc_is_stable_and_discriminating() {
        let a = crc32(&[0x45, 0, 0, 28]);
        let b = crc32(&[0x45, 0, 0, 28]);
        let c = crc32(&[0x45, 0, 0, 29]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_events_listed_per_packet() {
        let m = PktIdCrc32Module;
        let mut state = m.init_flow_rec(&ModParams::new()).unwrap();
        for i in 0..3u8 {
            let mut pkt = vec![0u8; 60];
            pkt[14] = 0x45;
            pkt[15] = i; // vary the tos byte
            let mut meta = PacketMeta {
                ts: 1_000_000 + i as u64,
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
                assert_eq!(elems.len(), 3);
                assert_eq!(elems[1][4], ("tos_byte".into(), Value::UInt(1)));
                assert_ne!(elems[0][2], elems[1][2], "tos changes the id");
            }
            other => panic!("expected event list, got {other:?}"),
        }
    }
}
