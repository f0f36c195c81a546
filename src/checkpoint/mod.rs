//! Checkpoints: immutable snapshots at superstep boundaries.
//!
//! A checkpoint captures channel values, per-channel versions, per-node
//! "versions seen", and the queue of pending sends. Checkpoints are pure
//! data — they are produced at the end of each superstep, persisted through
//! a [`CheckpointSaver`], and never mutated.
//!
//! Checkpoint ids are time-ordered UUIDs so a saver can return history
//! newest-first without a secondary index.

pub mod saver;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use saver::{
    CheckpointSaver, CheckpointTuple, InMemorySaver, ListOptions, PendingWrite, SaverError,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSaver;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::channels::Channel;
use crate::control::SendPacket;
use crate::types::ChannelVersion;

/// Current checkpoint schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Map of channel name to its latest version witness.
pub type ChannelVersions = FxHashMap<String, ChannelVersion>;

/// Map of node name (or the `__interrupt__` sentinel) to the channel
/// versions it has observed.
pub type VersionsSeen = FxHashMap<String, ChannelVersions>;

/// Generate a new time-ordered checkpoint id.
#[must_use]
pub fn new_checkpoint_id() -> Uuid {
    Uuid::now_v6(&rand::random::<[u8; 6]>())
}

/// Immutable snapshot of a thread's execution state at a superstep boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version of this structure.
    pub v: u32,
    /// Time-ordered unique id.
    pub id: Uuid,
    /// Creation timestamp.
    pub ts: DateTime<Utc>,
    /// Serialized channel snapshots (untracked channels are absent).
    pub channel_values: FxHashMap<String, Value>,
    /// Version witness for every channel that has ever been written.
    pub channel_versions: ChannelVersions,
    /// Per-node map of channel versions observed when the node last ran.
    pub versions_seen: VersionsSeen,
    /// Queued dynamic dispatches, consumed FIFO at the start of the next
    /// superstep.
    pub pending_sends: Vec<SendPacket>,
}

impl Checkpoint {
    /// A fresh checkpoint with no channel state.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            v: CHECKPOINT_SCHEMA_VERSION,
            id: new_checkpoint_id(),
            ts: Utc::now(),
            channel_values: FxHashMap::default(),
            channel_versions: ChannelVersions::default(),
            versions_seen: VersionsSeen::default(),
            pending_sends: Vec::new(),
        }
    }

    /// Capture the given channels into a new checkpoint, carrying versions
    /// and seen-maps forward and assigning a fresh id.
    #[must_use]
    pub fn capture(
        channels: &FxHashMap<String, Channel>,
        channel_versions: ChannelVersions,
        versions_seen: VersionsSeen,
        pending_sends: Vec<SendPacket>,
    ) -> Self {
        let mut channel_values = FxHashMap::default();
        for (name, channel) in channels {
            if let Some(snapshot) = channel.checkpoint() {
                channel_values.insert(name.clone(), snapshot);
            }
        }
        Self {
            v: CHECKPOINT_SCHEMA_VERSION,
            id: new_checkpoint_id(),
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            pending_sends,
        }
    }

    /// The highest version across all channels, if any channel has been
    /// written.
    #[must_use]
    pub fn max_channel_version(&self) -> Option<&ChannelVersion> {
        self.channel_versions.values().max()
    }

    /// The versions a node has seen, creating the entry on demand.
    pub fn seen_mut(&mut self, node: &str) -> &mut ChannelVersions {
        self.versions_seen.entry(node.to_string()).or_default()
    }
}

/// Where a checkpoint came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Produced by applying invocation input.
    Input,
    /// Produced by a superstep of the loop.
    Loop,
    /// Produced by an explicit state patch (`update_state`).
    Update,
    /// Produced by copying a thread.
    Fork,
}

/// Metadata persisted alongside a checkpoint; filterable via
/// [`ListOptions::filter`](saver::ListOptions).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// Superstep counter; the input checkpoint is step `-1`.
    pub step: i64,
    /// Namespace to parent checkpoint id, for nested graphs.
    #[serde(default)]
    pub parents: FxHashMap<String, Uuid>,
    /// Free-form metadata supplied by the caller; participates in filters.
    #[serde(default)]
    pub extra: FxHashMap<String, Value>,
}

impl CheckpointMetadata {
    #[must_use]
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            parents: FxHashMap::default(),
            extra: FxHashMap::default(),
        }
    }
}

/// Addressing key for checkpoint I/O.
///
/// Distinct threads may run concurrently with no coordination; all saver
/// operations key off `(thread_id, checkpoint_ns, checkpoint_id)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,
    /// Namespace path of nested graphs; empty for the root graph.
    #[serde(default)]
    pub checkpoint_ns: String,
    /// When set, addresses one specific checkpoint; otherwise the latest.
    #[serde(default)]
    pub checkpoint_id: Option<Uuid>,
}

impl CheckpointConfig {
    #[must_use]
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_ns: String::new(),
            checkpoint_id: None,
        }
    }

    #[must_use]
    pub fn with_ns(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, id: Uuid) -> Self {
        self.checkpoint_id = Some(id);
        self
    }

    /// Drop the checkpoint pin so lookups resolve to the latest snapshot.
    #[must_use]
    pub fn latest(mut self) -> Self {
        self.checkpoint_id = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_ids_are_time_ordered() {
        let a = new_checkpoint_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_checkpoint_id();
        assert!(a < b, "v6 ids must sort chronologically");
    }

    #[test]
    fn capture_excludes_untracked_channels() {
        let mut channels = FxHashMap::default();
        channels.insert("kept".to_string(), Channel::last_value());
        channels.insert("skipped".to_string(), Channel::untracked());
        channels
            .get_mut("kept")
            .unwrap()
            .update("kept", vec![serde_json::json!(1)])
            .unwrap();

        let cp = Checkpoint::capture(
            &channels,
            ChannelVersions::default(),
            VersionsSeen::default(),
            vec![],
        );
        assert!(cp.channel_values.contains_key("kept"));
        assert!(!cp.channel_values.contains_key("skipped"));
    }

    #[test]
    fn max_channel_version_tracks_all_channels() {
        let mut cp = Checkpoint::empty();
        cp.channel_versions
            .insert("a".into(), ChannelVersion::Int(3));
        cp.channel_versions
            .insert("b".into(), ChannelVersion::Int(7));
        assert_eq!(cp.max_channel_version(), Some(&ChannelVersion::Int(7)));
    }

    #[test]
    fn checkpoint_serde_roundtrip() {
        let mut cp = Checkpoint::empty();
        cp.channel_versions
            .insert("c".into(), ChannelVersion::Int(1));
        cp.pending_sends
            .push(SendPacket::new("n", serde_json::json!([1, 2])));
        let json = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cp.id);
        assert_eq!(back.pending_sends, cp.pending_sends);
        assert_eq!(back.channel_versions, cp.channel_versions);
    }
}
