//! Single-slot channels: at most one write per superstep.

use serde_json::Value;

use super::errors::ChannelError;
use super::snapshot::{opt_from_snapshot, opt_to_snapshot};

/// Holds at most one value per superstep.
///
/// An update with zero values is a no-op, with exactly one value replaces the
/// state, and with two or more fails with `InvalidUpdate` — this is the
/// mechanism behind the single-writer rule for plain state fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LastValue {
    value: Option<Value>,
}

impl LastValue {
    pub fn update(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        match values.len() {
            0 => Ok(false),
            1 => {
                self.value = values.into_iter().next();
                Ok(true)
            }
            n => Err(ChannelError::invalid_update(
                name,
                format!("received {n} values for a channel that holds one value per step"),
            )),
        }
    }

    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        self.value.clone().ok_or_else(|| ChannelError::empty(name))
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn checkpoint(&self) -> Value {
        opt_to_snapshot(&self.value)
    }

    pub fn restore(name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        Ok(Self {
            value: opt_from_snapshot(name, snapshot)?,
        })
    }
}

/// As [`LastValue`], but the written value only becomes readable after
/// `finish` fires — used to implement deferred nodes that must not observe
/// mid-run values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LastValueAfterFinish {
    value: Option<Value>,
    pending: Option<Value>,
}

impl LastValueAfterFinish {
    pub fn update(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        match values.len() {
            0 => Ok(false),
            1 => {
                self.pending = values.into_iter().next();
                Ok(true)
            }
            n => Err(ChannelError::invalid_update(
                name,
                format!("received {n} values for a channel that holds one value per step"),
            )),
        }
    }

    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        self.value.clone().ok_or_else(|| ChannelError::empty(name))
    }

    pub fn consume(&mut self) -> bool {
        if self.value.is_some() {
            self.value = None;
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self) -> bool {
        if self.pending.is_some() {
            self.value = self.pending.take();
            true
        } else {
            false
        }
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn checkpoint(&self) -> Value {
        Value::Array(vec![
            opt_to_snapshot(&self.value),
            opt_to_snapshot(&self.pending),
        ])
    }

    pub fn restore(name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        match snapshot {
            Value::Array(mut parts) if parts.len() == 2 => {
                let pending = opt_from_snapshot(name, parts.pop().unwrap_or(Value::Null))?;
                let value = opt_from_snapshot(name, parts.pop().unwrap_or(Value::Null))?;
                Ok(Self { value, pending })
            }
            other => Err(ChannelError::restore(
                name,
                format!("expected a two-element array, got {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_value_replaces_and_rejects_multi() {
        let mut ch = LastValue::default();
        assert!(!ch.update("c", vec![]).unwrap());
        assert!(ch.update("c", vec![json!(1)]).unwrap());
        assert!(ch.update("c", vec![json!(2)]).unwrap());
        assert_eq!(ch.get("c").unwrap(), json!(2));

        let err = ch.update("c", vec![json!(3), json!(4)]).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidUpdate { .. }));
        // failed update leaves the prior value intact
        assert_eq!(ch.get("c").unwrap(), json!(2));
    }

    #[test]
    fn last_value_empty_until_written() {
        let ch = LastValue::default();
        assert!(!ch.is_available());
        assert!(matches!(ch.get("c"), Err(ChannelError::Empty { .. })));
    }

    #[test]
    fn last_value_checkpoint_distinguishes_null_from_missing() {
        let mut ch = LastValue::default();
        ch.update("c", vec![Value::Null]).unwrap();
        let restored = LastValue::restore("c", ch.checkpoint()).unwrap();
        assert!(restored.is_available());
        assert_eq!(restored.get("c").unwrap(), Value::Null);

        let empty = LastValue::restore("c", LastValue::default().checkpoint()).unwrap();
        assert!(!empty.is_available());
    }

    #[test]
    fn after_finish_defers_delivery() {
        let mut ch = LastValueAfterFinish::default();
        ch.update("c", vec![json!("deferred")]).unwrap();
        assert!(!ch.is_available());
        assert!(ch.finish());
        assert_eq!(ch.get("c").unwrap(), json!("deferred"));
        assert!(ch.consume());
        assert!(!ch.is_available());
    }
}
