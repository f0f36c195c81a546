//! Short-lived and untracked value channels.

use serde_json::Value;

use super::errors::ChannelError;
use super::snapshot::{opt_from_snapshot, opt_to_snapshot};

/// Single-step visibility: the value written in one superstep is readable in
/// the next, then cleared by the step-boundary empty update or by `consume`.
///
/// Guarded instances reject multiple writes in one step; unguarded ones keep
/// the last write, which is what the engine's routing slots need when
/// several tasks fire the same target.
#[derive(Clone, Debug, PartialEq)]
pub struct EphemeralValue {
    guard: bool,
    value: Option<Value>,
}

impl Default for EphemeralValue {
    fn default() -> Self {
        Self::new(true)
    }
}

impl EphemeralValue {
    #[must_use]
    pub fn new(guard: bool) -> Self {
        Self { guard, value: None }
    }

    pub fn update(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        match values.len() {
            0 => {
                if self.value.is_some() {
                    self.value = None;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            1 => {
                self.value = values.into_iter().next();
                Ok(true)
            }
            n if self.guard => Err(ChannelError::invalid_update(
                name,
                format!("received {n} values in one step for an ephemeral channel"),
            )),
            _ => {
                self.value = values.into_iter().next_back();
                Ok(true)
            }
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

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }

    pub fn checkpoint(&self) -> Value {
        opt_to_snapshot(&self.value)
    }

    pub fn restore(&self, name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        Ok(Self {
            guard: self.guard,
            value: opt_from_snapshot(name, snapshot)?,
        })
    }
}

/// Holds the most recently written value regardless of how many tasks wrote
/// in the same superstep. Useful for advisory state where last-writer-wins
/// is acceptable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnyValue {
    value: Option<Value>,
}

impl AnyValue {
    pub fn update(&mut self, _name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        let Some(last) = values.into_iter().next_back() else {
            return Ok(false);
        };
        let changed = self.value.as_ref() != Some(&last);
        self.value = Some(last);
        Ok(changed)
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

/// Read-through value that is not checkpointed and does not participate in
/// versioning. Restores to empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UntrackedValue {
    value: Option<Value>,
}

impl UntrackedValue {
    pub fn update(&mut self, _name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        let Some(last) = values.into_iter().next_back() else {
            return Ok(false);
        };
        self.value = Some(last);
        // Untracked channels never report a change so they never bump versions.
        Ok(false)
    }

    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        self.value.clone().ok_or_else(|| ChannelError::empty(name))
    }

    pub fn is_available(&self) -> bool {
        self.value.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ephemeral_clears_on_empty_step() {
        let mut ch = EphemeralValue::default();
        ch.update("e", vec![json!("v")]).unwrap();
        assert!(ch.is_available());
        assert!(ch.update("e", vec![]).unwrap());
        assert!(!ch.is_available());
    }

    #[test]
    fn guarded_ephemeral_rejects_concurrent_writes() {
        let mut ch = EphemeralValue::default();
        assert!(ch.update("e", vec![json!(1), json!(2)]).is_err());
    }

    #[test]
    fn unguarded_ephemeral_keeps_last_write() {
        let mut ch = EphemeralValue::new(false);
        assert!(ch.update("e", vec![json!(1), json!(2)]).unwrap());
        assert_eq!(ch.get("e").unwrap(), json!(2));
    }

    #[test]
    fn ephemeral_restore_preserves_guard() {
        let mut ch = EphemeralValue::new(false);
        ch.update("e", vec![json!(1)]).unwrap();
        let mut restored = ch.restore("e", ch.checkpoint()).unwrap();
        assert!(restored.update("e", vec![json!(1), json!(2)]).is_ok());
    }

    #[test]
    fn any_value_takes_last_writer() {
        let mut ch = AnyValue::default();
        assert!(ch.update("a", vec![json!(1), json!(2), json!(3)]).unwrap());
        assert_eq!(ch.get("a").unwrap(), json!(3));
        // same value again is not an observable change
        assert!(!ch.update("a", vec![json!(3)]).unwrap());
    }

    #[test]
    fn untracked_never_reports_change() {
        let mut ch = UntrackedValue::default();
        assert!(!ch.update("u", vec![json!("x")]).unwrap());
        assert_eq!(ch.get("u").unwrap(), json!("x"));
    }
}
