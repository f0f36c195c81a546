//! Snapshot encoding helpers.
//!
//! Optional slots are encoded as a zero- or one-element array so that a
//! stored `null` value stays distinguishable from "never written".

use serde_json::Value;

use super::errors::ChannelError;

pub(crate) fn opt_to_snapshot(value: &Option<Value>) -> Value {
    match value {
        Some(v) => Value::Array(vec![v.clone()]),
        None => Value::Array(vec![]),
    }
}

pub(crate) fn opt_from_snapshot(name: &str, snapshot: Value) -> Result<Option<Value>, ChannelError> {
    match snapshot {
        Value::Array(mut items) if items.len() <= 1 => Ok(items.pop()),
        other => Err(ChannelError::restore(
            name,
            format!("expected a zero- or one-element array, got {other}"),
        )),
    }
}
