//! Export path: flow record queue, exporter and sinks.
//!
//! The bounded [`FlowRecordQueue`] decouples aggregation from output;
//! the [`Exporter`] pops records and hands them to each rule's configured
//! export modules, which render them into their wire or file format.

pub mod exporter;
pub mod module;
pub mod queue;
pub mod sinks;

pub use exporter::{ExportStats, Exporter};
pub use module::{ExportModule, ExportRegistry, ExportState};
pub use queue::{FlowRecordQueue, QueuedRecord};
