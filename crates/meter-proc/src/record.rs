//! Flow record containers handed from the processor to the exporter.

use bytes::Bytes;
use meter_common::UsecTs;

/// Measurement data of one module for one flow.
#[derive(Debug, Clone)]
pub struct FlowDataBlock {
    /// Per-rule flow sequence number
    pub flow_id: u64,
    /// First export of this flow
    pub new_flow: bool,
    /// Filter-derived flow key bytes (empty for the aggregate flow)
    pub key: Bytes,
    /// Measurement data encoded against the module schema
    pub data: Bytes,
}

/// All flows of one metric module at one export event.
#[derive(Debug, Clone)]
pub struct MetricData {
    /// Module that produced the data
    pub module: String,
    /// One block per flow
    pub flows: Vec<FlowDataBlock>,
}

/// One export event of one rule: the snapshot of every configured metric
/// module across the rule's flows.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    /// Rule uid
    pub rule_id: u32,
    /// `set.name` identifier for sinks
    pub rule_name: String,
    /// Export timestamp
    pub ts: UsecTs,
    /// Last record for the covered flows (stop, removal, idle timeout or
    /// an immediate-export request)
    pub final_rec: bool,
    /// Per-module data
    pub metrics: Vec<MetricData>,
}

impl FlowRecord {
    /// Total number of flow blocks across all modules.
    pub fn block_count(&self) -> usize {
        self.metrics.iter().map(|m| m.flows.len()).sum()
    }
}
