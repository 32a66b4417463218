//! Human-readable text sink.
//!
//! Dumps each record as labelled lines, one flow per line, fields decoded
//! against the metric module's schema. Mostly useful for debugging and
//! small deployments.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use meter_common::{MeterError, MeterResult};
use meter_proc::{decode_record, FlowRecord, ModParams, ModuleRegistry};

use crate::module::{ExportModule, ExportState};
use crate::sinks::{fmt_value, hex};

/// Text file (or stdout) exporter.
pub struct TextExport {
    metrics: Arc<ModuleRegistry>,
}

impl TextExport {
    /// Sink resolving metric schemas through `metrics`.
    pub fn new(metrics: Arc<ModuleRegistry>) -> Self {
        Self { metrics }
    }
}

struct TextState {
    out: Box<dyn Write + Send>,
}

impl ExportModule for TextExport {
    fn name(&self) -> &'static str {
        "text"
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
        Ok(Box::new(TextState { out }))
    }

    fn export_data(&self, record: &FlowRecord, state: &mut dyn ExportState) -> MeterResult<()> {
        let st = state
            .as_any_mut()
            .downcast_mut::<TextState>()
            .expect("text state");

        let when = DateTime::<Utc>::from_timestamp(
            (record.ts / 1_000_000) as i64,
            ((record.ts % 1_000_000) * 1000) as u32,
        )
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        writeln!(
            st.out,
            "# task {} (rule {}) at {} final={}",
            record.rule_name,
            record.rule_id,
            when.format("%Y-%m-%d %H:%M:%S%.6f"),
            record.final_rec
        )?;

        for metric in &record.metrics {
            let schema = self.metrics.schema_of(&metric.module)?;
            writeln!(st.out, "{}:", metric.module)?;
            for flow in &metric.flows {
                let fields = decode_record(schema, &flow.data)?;
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|(label, v)| format!("{label}={}", fmt_value(v)))
                    .collect();
                writeln!(
                    st.out,
                    "  flow {} key={} new={}: {}",
                    flow.flow_id,
                    if flow.key.is_empty() {
                        "-".to_string()
                    } else {
                        hex(&flow.key)
                    },
                    flow.new_flow,
                    rendered.join(" ")
                )?;
            }
        }
        st.out.flush()?;
        Ok(())
    }
}
