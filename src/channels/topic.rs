//! Accumulating pub-sub channel.

use serde_json::Value;

use super::errors::ChannelError;

/// Collects the values written during a superstep.
///
/// `get` yields the list produced during the preceding superstep. With
/// `accumulate` the list grows across steps instead of being replaced; with
/// `unique` duplicate values (by serialized form) are dropped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Topic {
    unique: bool,
    accumulate: bool,
    values: Vec<Value>,
}

impl Topic {
    pub fn new(unique: bool, accumulate: bool) -> Self {
        Self {
            unique,
            accumulate,
            values: Vec::new(),
        }
    }

    pub fn update(&mut self, _name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        let mut changed = false;
        if !self.accumulate && !values.is_empty() {
            // Each step's writes replace the previous step's list.
            changed = !self.values.is_empty();
            self.values.clear();
        }
        if values.is_empty() {
            if !self.accumulate && !self.values.is_empty() {
                self.values.clear();
                return Ok(true);
            }
            return Ok(changed);
        }
        for v in values {
            if self.unique && self.values.iter().any(|existing| existing == &v) {
                continue;
            }
            self.values.push(v);
            changed = true;
        }
        Ok(changed)
    }

    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        if self.values.is_empty() {
            Err(ChannelError::empty(name))
        } else {
            Ok(Value::Array(self.values.clone()))
        }
    }

    pub fn consume(&mut self) -> bool {
        if !self.accumulate && !self.values.is_empty() {
            self.values.clear();
            return true;
        }
        false
    }

    pub fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    pub fn checkpoint(&self) -> Value {
        Value::Array(self.values.clone())
    }

    pub fn restore(&self, name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        match snapshot {
            Value::Array(values) => Ok(Self {
                unique: self.unique,
                accumulate: self.accumulate,
                values,
            }),
            other => Err(ChannelError::restore(
                name,
                format!("expected an array, got {other}"),
            )),
        }
    }
}
