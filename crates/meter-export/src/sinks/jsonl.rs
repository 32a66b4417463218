//! JSON-lines sink: one JSON object per export event.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use meter_common::{MeterError, MeterResult};
use meter_proc::{decode_record, FlowRecord, ModParams, ModuleRegistry, Value};
use serde_json::json;

use crate::module::{ExportModule, ExportState};
use crate::sinks::hex;

/// JSON-lines file (or stdout) exporter.
pub struct JsonlExport {
    metrics: Arc<ModuleRegistry>,
}

impl JsonlExport {
    /// Sink resolving metric schemas through `metrics`.
    pub fn new(metrics: Arc<ModuleRegistry>) -> Self {
        Self { metrics }
    }
}

struct JsonlState {
    out: Box<dyn Write + Send>,
}

fn value_to_json(v: &Value) -> serde_json::Value {
    match v {
        Value::Char(c) => json!((*c as char).to_string()),
        Value::Int(i) => json!(i),
        Value::UInt(u) => json!(u),
        Value::Float(f) => json!(f),
        Value::Ipv4(b) => json!(std::net::Ipv4Addr::from(*b).to_string()),
        Value::Ipv6(b) => json!(std::net::Ipv6Addr::from(*b).to_string()),
        Value::Str(s) => json!(s),
        Value::Bin(b) => json!(hex(b)),
        Value::List(elems) => json!(elems
            .iter()
            .map(|fields| {
                fields
                    .iter()
                    .map(|(label, v)| (label.clone(), value_to_json(v)))
                    .collect::<serde_json::Map<String, serde_json::Value>>()
            })
            .collect::<Vec<_>>()),
    }
}

impl ExportModule for JsonlExport {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn init_export_rec(&self, params: &ModParams) -> MeterResult<Box<dyn ExportState>> {
        let out: Box<dyn Write + Send> = match params.get("file") {
            Some(path) => Box::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(MeterError::Io)?,
            ),
            None => Box::new(std::io::stdout()),
        };
        Ok(Box::new(JsonlState { out }))
    }

    fn export_data(&self, record: &FlowRecord, state: &mut dyn ExportState) -> MeterResult<()> {
        let st = state
            .as_any_mut()
            .downcast_mut::<JsonlState>()
            .expect("jsonl state");

        let mut modules = serde_json::Map::new();
        for metric in &record.metrics {
            let schema = self.metrics.schema_of(&metric.module)?;
            let flows: Vec<serde_json::Value> = metric
                .flows
                .iter()
                .map(|flow| {
                    let fields = decode_record(schema, &flow.data).map(|fields| {
                        fields
                            .iter()
                            .map(|(label, v)| (label.clone(), value_to_json(v)))
                            .collect::<serde_json::Map<String, serde_json::Value>>()
                    })?;
                    Ok(json!({
                        "flow_id": flow.flow_id,
                        "new": flow.new_flow,
                        "key": hex(&flow.key),
                        "fields": fields,
                    }))
                })
                .collect::<MeterResult<_>>()?;
            modules.insert(metric.module.clone(), json!(flows));
        }

        let line = json!({
            "rule": record.rule_id,
            "task": record.rule_name,
            "ts_us": record.ts,
            "final": record.final_rec,
            "modules": modules,
        });
        writeln!(st.out, "{line}")?;
        st.out.flush()?;
        Ok(())
    }
}
