//! State schema binding.
//!
//! Turns a user-declared state shape into the set of channels, reducers,
//! and defaults the engine consumes. Each declared field becomes a named
//! channel; invocation input is split across fields, and the aggregated
//! state read back out of the channels is what nodes and callers observe.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::channels::Channel;
use crate::types::is_reserved;

use super::GraphCompileError;

/// Ordered set of state fields, each bound to a channel prototype.
///
/// The prototypes carry reducers and declared name sets; instantiating a
/// schema clones them into fresh channels.
///
/// # Examples
///
/// ```
/// use stepgraph::channels::{sum_aggregate, Channel};
/// use stepgraph::graphs::StateSchema;
///
/// let schema = StateSchema::new()
///     .field("input", Channel::last_value())
///     .field("total", sum_aggregate())
///     .field("output", Channel::last_value());
/// ```
#[derive(Clone, Debug, Default)]
pub struct StateSchema {
    fields: Vec<(String, Channel)>,
    /// Field non-object inputs are written to.
    input_field: Option<String>,
}

impl StateSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a state field bound to the given channel prototype.
    ///
    /// Later declarations of the same name replace earlier ones.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, channel: Channel) -> Self {
        let name = name.into();
        self.fields.retain(|(n, _)| n != &name);
        self.fields.push((name, channel));
        self
    }

    /// Designate the field that receives bare (non-object) inputs.
    /// Defaults to a field named `input`, else the first declared field.
    #[must_use]
    pub fn input_field(mut self, name: impl Into<String>) -> Self {
        self.input_field = Some(name.into());
        self
    }

    /// Validate field names against the reserved set.
    pub(crate) fn validate(&self) -> Result<(), GraphCompileError> {
        for (name, _) in &self.fields {
            if name.is_empty() || is_reserved(name) || name.contains(crate::types::NS_SEP) {
                return Err(GraphCompileError::ReservedChannelName { name: name.clone() });
            }
        }
        Ok(())
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Clone the prototypes into a fresh channel map.
    #[must_use]
    pub fn instantiate(&self) -> FxHashMap<String, Channel> {
        self.fields
            .iter()
            .map(|(name, proto)| (name.clone(), proto.clone()))
            .collect()
    }

    /// Split invocation input into per-field writes.
    ///
    /// Object inputs write each key that names a declared field; unknown
    /// keys are rejected. Bare inputs go to the designated input field.
    pub fn input_writes(&self, input: Value) -> Result<Vec<(String, Value)>, GraphCompileError> {
        match input {
            Value::Object(map) if map.keys().all(|k| self.contains(k)) => {
                Ok(map.into_iter().collect())
            }
            Value::Object(map) => {
                let unknown = map
                    .keys()
                    .find(|k| !self.contains(k))
                    .cloned()
                    .unwrap_or_default();
                Err(GraphCompileError::UnknownInputField { name: unknown })
            }
            bare => {
                let field = self
                    .input_field
                    .clone()
                    .or_else(|| {
                        self.contains("input")
                            .then(|| "input".to_string())
                            .or_else(|| self.fields.first().map(|(n, _)| n.clone()))
                    })
                    .ok_or(GraphCompileError::EmptySchema)?;
                Ok(vec![(field, bare)])
            }
        }
    }

    /// Aggregate the readable values of the schema's channels.
    #[must_use]
    pub fn read_values(&self, channels: &FxHashMap<String, Channel>) -> FxHashMap<String, Value> {
        let mut out = FxHashMap::default();
        for (name, _) in &self.fields {
            if let Some(channel) = channels.get(name) {
                if let Ok(value) = channel.get(name) {
                    out.insert(name.clone(), value);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::new()
            .field("input", Channel::last_value())
            .field("output", Channel::last_value())
    }

    #[test]
    fn bare_input_goes_to_input_field() {
        let writes = schema().input_writes(json!(2)).unwrap();
        assert_eq!(writes, vec![("input".to_string(), json!(2))]);
    }

    #[test]
    fn object_input_splits_per_field() {
        let writes = schema()
            .input_writes(json!({"input": 1, "output": 2}))
            .unwrap();
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = schema().input_writes(json!({"bogus": 1})).unwrap_err();
        assert!(matches!(err, GraphCompileError::UnknownInputField { .. }));
    }

    #[test]
    fn read_values_skips_empty_channels() {
        let s = schema();
        let mut channels = s.instantiate();
        channels
            .get_mut("input")
            .unwrap()
            .update("input", vec![json!(5)])
            .unwrap();
        let values = s.read_values(&channels);
        assert_eq!(values.get("input"), Some(&json!(5)));
        assert!(!values.contains_key("output"));
    }

    #[test]
    fn reserved_field_names_fail_validation() {
        let s = StateSchema::new().field(crate::types::TASKS, Channel::last_value());
        assert!(s.validate().is_err());
    }
}
