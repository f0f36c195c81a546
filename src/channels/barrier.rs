//! Fan-in barrier channels.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::errors::ChannelError;

fn names_from_values(
    name: &str,
    values: Vec<Value>,
    allowed: &BTreeSet<String>,
) -> Result<Vec<String>, ChannelError> {
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) if allowed.contains(&s) => Ok(s),
            other => Err(ChannelError::invalid_update(
                name,
                format!("unexpected barrier contributor {other}"),
            )),
        })
        .collect()
}

fn set_from_snapshot(name: &str, snapshot: Value) -> Result<BTreeSet<String>, ChannelError> {
    serde_json::from_value(snapshot)
        .map_err(|e| ChannelError::restore(name, format!("expected an array of names: {e}")))
}

/// Becomes available only after every member of a declared name set has
/// contributed an update — the mechanism behind "wait for all predecessors".
///
/// Contributors write their own name; the value delivered on `get` is null
/// (the barrier carries rendezvous, not data). `consume` resets the barrier
/// so it can re-arm on cyclic graphs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NamedBarrier {
    names: BTreeSet<String>,
    seen: BTreeSet<String>,
}

impl NamedBarrier {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
            seen: BTreeSet::new(),
        }
    }

    pub fn update(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        let mut changed = false;
        for contributor in names_from_values(name, values, &self.names)? {
            changed |= self.seen.insert(contributor);
        }
        Ok(changed)
    }

    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        if self.is_available() {
            Ok(Value::Null)
        } else {
            Err(ChannelError::empty(name))
        }
    }

    pub fn consume(&mut self) -> bool {
        if self.is_available() {
            self.seen.clear();
            true
        } else {
            false
        }
    }

    pub fn is_available(&self) -> bool {
        !self.names.is_empty() && self.seen == self.names
    }

    pub fn checkpoint(&self) -> Value {
        json!(self.seen)
    }

    pub fn restore(&self, name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        Ok(Self {
            names: self.names.clone(),
            seen: set_from_snapshot(name, snapshot)?,
        })
    }
}

/// As [`NamedBarrier`], but delivery is delayed until `finish` — the barrier
/// releases only once no further step will run in the current invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NamedBarrierAfterFinish {
    names: BTreeSet<String>,
    seen: BTreeSet<String>,
    finished: bool,
}

impl NamedBarrierAfterFinish {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
            seen: BTreeSet::new(),
            finished: false,
        }
    }

    pub fn update(&mut self, name: &str, values: Vec<Value>) -> Result<bool, ChannelError> {
        let mut changed = false;
        for contributor in names_from_values(name, values, &self.names)? {
            changed |= self.seen.insert(contributor);
        }
        Ok(changed)
    }

    pub fn get(&self, name: &str) -> Result<Value, ChannelError> {
        if self.is_available() {
            Ok(Value::Null)
        } else {
            Err(ChannelError::empty(name))
        }
    }

    pub fn consume(&mut self) -> bool {
        if self.is_available() {
            self.seen.clear();
            self.finished = false;
            true
        } else {
            false
        }
    }

    pub fn finish(&mut self) -> bool {
        if !self.finished && !self.names.is_empty() && self.seen == self.names {
            self.finished = true;
            true
        } else {
            false
        }
    }

    pub fn is_available(&self) -> bool {
        self.finished && !self.names.is_empty() && self.seen == self.names
    }

    pub fn checkpoint(&self) -> Value {
        json!({ "seen": self.seen, "finished": self.finished })
    }

    pub fn restore(&self, name: &str, snapshot: Value) -> Result<Self, ChannelError> {
        let seen = set_from_snapshot(
            name,
            snapshot.get("seen").cloned().unwrap_or(Value::Null),
        )?;
        let finished = snapshot
            .get("finished")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            names: self.names.clone(),
            seen,
            finished,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_after_all_names() {
        let mut b = NamedBarrier::new(["a".to_string(), "b".to_string()]);
        b.update("j", vec![json!("a")]).unwrap();
        assert!(!b.is_available());
        b.update("j", vec![json!("b")]).unwrap();
        assert!(b.is_available());
        assert_eq!(b.get("j").unwrap(), Value::Null);
        assert!(b.consume());
        assert!(!b.is_available());
    }

    #[test]
    fn duplicate_contribution_is_not_a_change() {
        let mut b = NamedBarrier::new(["a".to_string(), "b".to_string()]);
        assert!(b.update("j", vec![json!("a")]).unwrap());
        assert!(!b.update("j", vec![json!("a")]).unwrap());
    }

    #[test]
    fn rejects_unknown_contributor() {
        let mut b = NamedBarrier::new(["a".to_string()]);
        let err = b.update("j", vec![json!("intruder")]).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidUpdate { .. }));
    }

    #[test]
    fn after_finish_variant_waits_for_finish() {
        let mut b = NamedBarrierAfterFinish::new(["a".to_string()]);
        b.update("j", vec![json!("a")]).unwrap();
        assert!(!b.is_available());
        assert!(b.finish());
        assert!(b.is_available());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut b = NamedBarrier::new(["a".to_string(), "b".to_string()]);
        b.update("j", vec![json!("a")]).unwrap();
        let restored = b.restore("j", b.checkpoint()).unwrap();
        assert_eq!(restored, b);
    }
}
