//! Shared state for the packet-id generator modules.
//!
//! Both id generators record one event per packet (timestamp, id, wire
//! length, tos byte) into a bounded list that drains on every export.

use meter_common::{MeterError, MeterResult, PacketMeta, PktLayer, UsecTs};
use tracing::warn;

use crate::schema::{DataType, TypeInfo};
use crate::wire::RecordWriter;

/// Bytes hashed starting at the network header (header plus a few payload
/// bytes, enough to tell retransmissions and id-field twins apart)
pub const HASH_WINDOW: usize = 47;

/// Default cap on buffered events between exports
const DEFAULT_MAX_EVENTS: usize = 65536;

/// Event list schema shared by the id generators.
pub const SCHEMA: &[TypeInfo] = &[
    TypeInfo::new(DataType::List, "packetno"),
    TypeInfo::new(DataType::UInt32, "tstamp_sec"),
    TypeInfo::new(DataType::UInt32, "tstamp_usec"),
    TypeInfo::new(DataType::UInt32, "packet_id"),
    TypeInfo::new(DataType::UInt16, "packet_length"),
    TypeInfo::new(DataType::UInt8, "tos_byte"),
    TypeInfo::new(DataType::ListEnd, "packetno_end"),
];

/// One identified packet.
#[derive(Debug, Clone, Copy)]
pub struct PktEvent {
    pub(crate) ts: UsecTs,
    pub(crate) id: u32,
    pub(crate) len: u16,
    pub(crate) tos: u8,
}

impl PktEvent {
    /// Build an event from packet metadata and a computed id.
    pub fn from_packet(meta: &PacketMeta, pkt: &[u8], id: u32) -> Self {
        let tos = meta
            .layer_offs(PktLayer::Net)
            .and_then(|n| pkt.get(n + 1))
            .copied()
            .unwrap_or(0);
        Self {
            ts: meta.ts,
            id,
            len: meta.wire_len.min(u16::MAX as u32) as u16,
            tos,
        }
    }
}

/// Bounded per-flow event buffer.
#[derive(Debug)]
pub struct PktIdState {
    events: Vec<PktEvent>,
    max_events: usize,
    /// Events dropped on a full buffer since the last export
    pub(crate) overflowed: u64,
}

impl PktIdState {
    /// Parse the optional `maxpkts` parameter.
    pub fn from_params(module: &'static str, params: &crate::module::ModParams) -> MeterResult<Self> {
        let max_events = match params.get("maxpkts") {
            Some(v) => v.parse::<usize>().map_err(|_| MeterError::ModuleParams {
                module: module.into(),
                reason: format!("maxpkts is not a number: {v}"),
            })?,
            None => DEFAULT_MAX_EVENTS,
        };
        Ok(Self {
            events: Vec::new(),
            max_events: max_events.max(1),
            overflowed: 0,
        })
    }

    /// Append an event, counting overflow beyond the cap.
    pub fn record(&mut self, ev: PktEvent) {
        if self.events.len() >= self.max_events {
            if self.overflowed == 0 {
                warn!(cap = self.max_events, "packet id buffer full until next export");
            }
            self.overflowed += 1;
            return;
        }
        self.events.push(ev);
    }

    /// Drop buffered events (interval reset).
    pub fn clear(&mut self) {
        self.events.clear();
        self.overflowed = 0;
    }

    /// Render the buffered events against [`SCHEMA`].
    pub fn export(&self, w: &mut RecordWriter, split: fn(UsecTs) -> (u32, u32)) {
        w.put_list_count(self.events.len() as u32);
        for ev in &self.events {
            let (sec, usec) = split(ev.ts);
            w.put_u32(sec);
            w.put_u32(usec);
            w.put_u32(ev.id);
            w.put_u16(ev.len);
            w.put_u8(ev.tos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModParams;

    #[test]
    fn test_buffer_cap() {
        let params = ModParams::from([("maxpkts".to_string(), "2".to_string())]);
        let mut s = PktIdState::from_params("pktid_crc32", &params).unwrap();
        for i in 0..4 {
            s.record(PktEvent {
                ts: i,
                id: i as u32,
                len: 60,
                tos: 0,
            });
        }
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.overflowed, 2);
        s.clear();
        assert_eq!(s.events.len(), 0);
    }

    #[test]
    fn test_bad_param_rejected() {
        let params = ModParams::from([("maxpkts".to_string(), "lots".to_string())]);
        assert!(PktIdState::from_params("pktid_crc32", &params).is_err());
    }
}
