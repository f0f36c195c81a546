//! Checkpoint persistence contract and the in-memory reference saver.
//!
//! Savers provide durable storage for checkpoints keyed by
//! `(thread_id, checkpoint_ns, checkpoint_id)`, enabling resumption across
//! process restarts, time travel through history, and crash-safe redelivery
//! of pending task writes.
//!
//! # Implementation notes
//!
//! - `put` replaces nothing: every checkpoint is a new row; `get_tuple`
//!   without a pinned id resolves to the newest.
//! - `put_writes` must be visible at-least-once; duplicates are deduplicated
//!   by `(task_id, channel, idx)`.
//! - `list` returns newest-first; `filter` uses equality containment over the
//!   metadata JSON (subset match, including explicit nulls).

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::{Checkpoint, CheckpointConfig, CheckpointMetadata, ChannelVersions};

/// Errors from saver operations.
#[derive(Debug, Error, Diagnostic)]
pub enum SaverError {
    /// Backend storage error (database, filesystem, etc.).
    #[error("saver backend error: {message}")]
    #[diagnostic(
        code(stepgraph::saver::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Serialization of a checkpoint or write failed.
    #[error("saver serialization error: {source}")]
    #[diagnostic(code(stepgraph::saver::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    /// Other saver errors.
    #[error("saver error: {message}")]
    #[diagnostic(code(stepgraph::saver::other))]
    Other { message: String },
}

pub type Result<T> = std::result::Result<T, SaverError>;

/// A single buffered task write, deduplicated by `(task_id, channel, idx)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: Uuid,
    pub channel: String,
    pub value: Value,
    pub idx: usize,
}

/// Everything a loop needs to resume from a stored checkpoint.
#[derive(Clone, Debug)]
pub struct CheckpointTuple {
    /// Config addressing this checkpoint (id set).
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    /// Config of the preceding checkpoint on the same thread, if any.
    pub parent_config: Option<CheckpointConfig>,
    /// Writes recorded against this checkpoint by tasks of the (possibly
    /// crashed) next superstep.
    pub pending_writes: Vec<PendingWrite>,
}

/// Pagination and filtering for [`CheckpointSaver::list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    /// Only return checkpoints created strictly before this id.
    pub before: Option<Uuid>,
    /// Equality-containment filter over the metadata JSON.
    pub filter: Option<Value>,
}

/// Durable K/V store for checkpoints.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch the checkpoint addressed by `config` — the pinned id when set,
    /// otherwise the newest for `(thread_id, checkpoint_ns)`.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints for `(thread_id, checkpoint_ns)`, newest first.
    async fn list(
        &self,
        config: &CheckpointConfig,
        options: &ListOptions,
    ) -> Result<Vec<CheckpointTuple>>;

    /// Persist a checkpoint; returns the config with `checkpoint_id` set.
    ///
    /// `new_versions` names the channels whose version advanced in this step,
    /// letting incremental backends store only changed blobs.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Record task writes against the checkpoint addressed by `config`.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        task_id: Uuid,
    ) -> Result<()>;

    /// Delete all checkpoints (every namespace) of a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Copy all checkpoints of one thread to another id.
    async fn copy_thread(&self, src_thread_id: &str, dst_thread_id: &str) -> Result<()>;
}

/// Equality-containment match of `filter` against a metadata JSON value:
/// every key in the filter must be present in the target with an equal value
/// (`null` in the filter matches only an explicit `null`). Non-object
/// filters compare by equality.
#[must_use]
pub fn metadata_matches(filter: &Value, metadata: &Value) -> bool {
    match (filter, metadata) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| {
            have.get(k)
                .is_some_and(|actual| metadata_matches(v, actual))
        }),
        (want, have) => want == have,
    }
}

#[derive(Clone, Debug)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent_id: Option<Uuid>,
    writes: Vec<PendingWrite>,
}

type ThreadKey = (String, String);

/// Volatile saver for tests and ephemeral runs. Stores full history per
/// `(thread_id, checkpoint_ns)`, ordered by the time-sortable checkpoint id.
#[derive(Default)]
pub struct InMemorySaver {
    inner: RwLock<FxHashMap<ThreadKey, BTreeMap<Uuid, StoredCheckpoint>>>,
}

impl InMemorySaver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tuple_from(
        &self,
        key: &ThreadKey,
        id: Uuid,
        stored: &StoredCheckpoint,
    ) -> CheckpointTuple {
        let config = CheckpointConfig {
            thread_id: key.0.clone(),
            checkpoint_ns: key.1.clone(),
            checkpoint_id: Some(id),
        };
        let parent_config = stored.parent_id.map(|pid| CheckpointConfig {
            thread_id: key.0.clone(),
            checkpoint_ns: key.1.clone(),
            checkpoint_id: Some(pid),
        });
        CheckpointTuple {
            config,
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent_config,
            pending_writes: stored.writes.clone(),
        }
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let guard = self.inner.read();
        let Some(history) = guard.get(&key) else {
            return Ok(None);
        };
        let entry = match config.checkpoint_id {
            Some(id) => history.get_key_value(&id),
            None => history.iter().next_back(),
        };
        Ok(entry.map(|(id, stored)| self.tuple_from(&key, *id, stored)))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        options: &ListOptions,
    ) -> Result<Vec<CheckpointTuple>> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let guard = self.inner.read();
        let Some(history) = guard.get(&key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (id, stored) in history.iter().rev() {
            if let Some(before) = options.before {
                if *id >= before {
                    continue;
                }
            }
            if let Some(filter) = &options.filter {
                let meta_json = serde_json::to_value(&stored.metadata)?;
                if !metadata_matches(filter, &meta_json) {
                    continue;
                }
            }
            out.push(self.tuple_from(&key, *id, stored));
            if options.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let id = checkpoint.id;
        let mut guard = self.inner.write();
        let history = guard.entry(key).or_default();
        let parent_id = config
            .checkpoint_id
            .or_else(|| history.keys().next_back().copied());
        history.insert(
            id,
            StoredCheckpoint {
                checkpoint,
                metadata,
                parent_id,
                writes: Vec::new(),
            },
        );
        Ok(CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(id),
        })
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        _task_id: Uuid,
    ) -> Result<()> {
        let key = (config.thread_id.clone(), config.checkpoint_ns.clone());
        let Some(checkpoint_id) = config.checkpoint_id else {
            return Err(SaverError::Other {
                message: "put_writes requires a pinned checkpoint_id".to_string(),
            });
        };
        let mut guard = self.inner.write();
        let stored = guard
            .get_mut(&key)
            .and_then(|history| history.get_mut(&checkpoint_id))
            .ok_or_else(|| SaverError::Other {
                message: format!("unknown checkpoint {checkpoint_id}"),
            })?;
        for write in writes {
            let duplicate = stored.writes.iter().any(|w| {
                w.task_id == write.task_id && w.channel == write.channel && w.idx == write.idx
            });
            if !duplicate {
                stored.writes.push(write);
            }
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.inner.write().retain(|(tid, _), _| tid != thread_id);
        Ok(())
    }

    async fn copy_thread(&self, src_thread_id: &str, dst_thread_id: &str) -> Result<()> {
        let mut guard = self.inner.write();
        let copied: Vec<(ThreadKey, BTreeMap<Uuid, StoredCheckpoint>)> = guard
            .iter()
            .filter(|((tid, _), _)| tid == src_thread_id)
            .map(|((_, ns), history)| ((dst_thread_id.to_string(), ns.clone()), history.clone()))
            .collect();
        for (key, history) in copied {
            guard.insert(key, history);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use serde_json::json;

    fn cfg(thread: &str) -> CheckpointConfig {
        CheckpointConfig::new(thread)
    }

    #[tokio::test]
    async fn put_then_get_latest() {
        let saver = InMemorySaver::new();
        let cp = Checkpoint::empty();
        let id = cp.id;
        let stored_cfg = saver
            .put(
                &cfg("t1"),
                cp,
                CheckpointMetadata::new(CheckpointSource::Input, -1),
                ChannelVersions::default(),
            )
            .await
            .unwrap();
        assert_eq!(stored_cfg.checkpoint_id, Some(id));

        let tuple = saver.get_tuple(&cfg("t1")).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, id);
        assert!(tuple.parent_config.is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filterable() {
        let saver = InMemorySaver::new();
        for step in 0..3 {
            saver
                .put(
                    &cfg("t1"),
                    Checkpoint::empty(),
                    CheckpointMetadata::new(CheckpointSource::Loop, step),
                    ChannelVersions::default(),
                )
                .await
                .unwrap();
        }
        let all = saver
            .list(&cfg("t1"), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].checkpoint.id > all[2].checkpoint.id);
        assert_eq!(all[0].metadata.step, 2);

        let filtered = saver
            .list(
                &cfg("t1"),
                &ListOptions {
                    filter: Some(json!({"step": 1})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].metadata.step, 1);
    }

    #[tokio::test]
    async fn writes_are_deduplicated() {
        let saver = InMemorySaver::new();
        let stored_cfg = saver
            .put(
                &cfg("t1"),
                Checkpoint::empty(),
                CheckpointMetadata::new(CheckpointSource::Input, -1),
                ChannelVersions::default(),
            )
            .await
            .unwrap();

        let task = Uuid::new_v4();
        let write = PendingWrite {
            task_id: task,
            channel: "out".to_string(),
            value: json!(1),
            idx: 0,
        };
        saver
            .put_writes(&stored_cfg, vec![write.clone()], task)
            .await
            .unwrap();
        saver
            .put_writes(&stored_cfg, vec![write], task)
            .await
            .unwrap();

        let tuple = saver.get_tuple(&stored_cfg).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
    }

    #[tokio::test]
    async fn threads_are_isolated_and_copyable() {
        let saver = InMemorySaver::new();
        saver
            .put(
                &cfg("a"),
                Checkpoint::empty(),
                CheckpointMetadata::new(CheckpointSource::Input, -1),
                ChannelVersions::default(),
            )
            .await
            .unwrap();
        assert!(saver.get_tuple(&cfg("b")).await.unwrap().is_none());

        saver.copy_thread("a", "b").await.unwrap();
        assert!(saver.get_tuple(&cfg("b")).await.unwrap().is_some());

        saver.delete_thread("a").await.unwrap();
        assert!(saver.get_tuple(&cfg("a")).await.unwrap().is_none());
        assert!(saver.get_tuple(&cfg("b")).await.unwrap().is_some());
    }

    #[test]
    fn metadata_subset_matching() {
        let meta = json!({"source": "loop", "step": 3, "extra": {"user": null}});
        assert!(metadata_matches(&json!({"source": "loop"}), &meta));
        assert!(metadata_matches(&json!({"extra": {"user": null}}), &meta));
        assert!(!metadata_matches(&json!({"step": 4}), &meta));
        assert!(!metadata_matches(&json!({"missing": null}), &meta));
    }
}
