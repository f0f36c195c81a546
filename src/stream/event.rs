//! Stream event shapes.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognized streaming modes; a consumer may subscribe to several at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Aggregated channel values at the end of each step.
    Values,
    /// Per-node writes at the end of each step.
    Updates,
    /// Message-typed events produced by nodes during execution.
    Messages,
    /// Internal task-level bookkeeping.
    Debug,
    /// Arbitrary payloads written through the injected node writer.
    Custom,
}

/// One entry in the stream log.
///
/// Events carry a monotonically increasing `id`; a reconnecting consumer
/// passes the last id it saw and receives the suffix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: u64,
    #[serde(flatten)]
    pub payload: StreamPayload,
}

/// Mode-tagged event payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamPayload {
    Values {
        step: i64,
        values: FxHashMap<String, Value>,
    },
    Updates {
        step: i64,
        /// Node name to the writes it committed this step.
        updates: FxHashMap<String, Vec<(String, Value)>>,
    },
    Messages {
        node: String,
        message: Value,
    },
    Debug {
        step: i64,
        event: String,
        payload: Value,
    },
    Custom {
        node: String,
        payload: Value,
    },
}

impl StreamPayload {
    /// The mode this payload belongs to.
    #[must_use]
    pub fn mode(&self) -> StreamMode {
        match self {
            StreamPayload::Values { .. } => StreamMode::Values,
            StreamPayload::Updates { .. } => StreamMode::Updates,
            StreamPayload::Messages { .. } => StreamMode::Messages,
            StreamPayload::Debug { .. } => StreamMode::Debug,
            StreamPayload::Custom { .. } => StreamMode::Custom,
        }
    }
}
