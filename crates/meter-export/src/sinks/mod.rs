//! Built-in export sinks.

pub mod jsonl;
pub mod text;

use meter_proc::Value;

/// Render a decoded field value for human-readable output.
pub(crate) fn fmt_value(v: &Value) -> String {
    match v {
        Value::Char(c) => (*c as char).to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => format!("{f}"),
        Value::Ipv4(b) => std::net::Ipv4Addr::from(*b).to_string(),
        Value::Ipv6(b) => std::net::Ipv6Addr::from(*b).to_string(),
        Value::Str(s) => s.clone(),
        Value::Bin(b) => hex(b),
        Value::List(elems) => format!("[{} elements]", elems.len()),
    }
}

/// Lowercase hex rendering of a byte string.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
