//! Packet processing: metric module host, flow tables and record codec.
//!
//! For every packet the classifier matched, the processor locates the flow
//! record under the packet's flow key and runs the rule's metric module
//! chain over it. Modules own their per-flow state as opaque boxed values
//! and render measurements against a declared type schema; the wire codec
//! in [`wire`] turns those schemas into self-describing records.

pub mod module;
pub mod modules;
pub mod processor;
pub mod record;
pub mod schema;
pub mod wire;

pub use module::{
    FlowData, MetricModule, ModParams, ModuleRegistry, PacketVerdict, TimerSpec,
};
pub use processor::{PacketProcessor, ProcStats};
pub use record::{FlowDataBlock, FlowRecord, MetricData};
pub use schema::{DataType, TypeInfo};
pub use wire::{decode_record, RecordReader, RecordWriter, Value};
