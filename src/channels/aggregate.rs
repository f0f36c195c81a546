//! Fold-based aggregation channel.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::errors::ChannelError;
use super::snapshot::{opt_from_snapshot, opt_to_snapshot};

/// Binary reduction function `(acc, value) -> acc`.
pub type BinaryOperator = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Produces the initial accumulator value.
pub type ZeroFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Folds all incoming values with a binary operator, starting from a zero
/// function. The accumulator is always readable once the channel exists, so
/// counters and running totals survive steps in which nothing writes.
#[derive(Clone)]
pub struct BinaryOperatorAggregate {
    op: BinaryOperator,
    zero: ZeroFn,
    value: Option<Value>,
}

impl BinaryOperatorAggregate {
    pub fn new(op: BinaryOperator, zero: ZeroFn) -> Self {
        let value = Some(zero());
        Self { op, zero, value }
    }

    pub fn update(&mut self, _name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        if values.is_empty() {
            return Ok(false);
        }
        let mut acc = self.value.take().unwrap_or_else(|| (self.zero)());
        for v in values {
            acc = (self.op)(acc, v);
        }
        self.value = Some(acc);
        Ok(true)
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

    pub fn restore(&self, name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        Ok(Self {
            op: Arc::clone(&self.op),
            zero: Arc::clone(&self.zero),
            value: opt_from_snapshot(name, snapshot)?,
        })
    }
}

impl fmt::Debug for BinaryOperatorAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryOperatorAggregate")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl PartialEq for BinaryOperatorAggregate {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}
