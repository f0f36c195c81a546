//! Per-invocation runtime configuration.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::checkpoint::CheckpointConfig;
use crate::stream::StreamMode;

/// Configuration carried by one invocation.
///
/// `thread_id` selects the checkpoint lineage; invocations without one run
/// on a generated throwaway thread. The `configurable` map is opaque to the
/// engine and passed through for user code.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub thread_id: Option<String>,
    pub checkpoint_ns: String,
    /// Pin a historical checkpoint (time travel / forking).
    pub checkpoint_id: Option<Uuid>,
    /// Maximum supersteps per invocation.
    pub recursion_limit: usize,
    /// Concurrent tasks per superstep.
    pub max_concurrency: usize,
    /// Optional per-step deadline.
    pub step_timeout: Option<Duration>,
    /// Modes the loop emits to the stream.
    pub stream_modes: Vec<StreamMode>,
    pub tags: Vec<String>,
    pub configurable: FxHashMap<String, Value>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            recursion_limit: 25,
            max_concurrency: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            step_timeout: None,
            stream_modes: vec![StreamMode::Updates, StreamMode::Values],
            tags: Vec::new(),
            configurable: FxHashMap::default(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_checkpoint_ns(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, id: Uuid) -> Self {
        self.checkpoint_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_stream_modes(mut self, modes: Vec<StreamMode>) -> Self {
        self.stream_modes = modes;
        self
    }

    #[must_use]
    pub fn with_configurable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    /// The thread id, generating a throwaway one when absent.
    #[must_use]
    pub fn resolved_thread_id(&self) -> String {
        self.thread_id
            .clone()
            .unwrap_or_else(|| format!("ephemeral-{}", Uuid::new_v4()))
    }

    /// The checkpoint addressing key this config implies.
    #[must_use]
    pub fn checkpoint_config(&self, thread_id: &str) -> CheckpointConfig {
        CheckpointConfig {
            thread_id: thread_id.to_string(),
            checkpoint_ns: self.checkpoint_ns.clone(),
            checkpoint_id: self.checkpoint_id,
        }
    }
}

/// Resolve the SQLite database URL from the environment.
///
/// Honors `STEPGRAPH_SQLITE_URL` first, then `SQLITE_DB_NAME` (as a bare
/// file name), defaulting to `stepgraph.db` in the working directory.
#[must_use]
pub fn default_sqlite_url() -> String {
    dotenvy::dotenv().ok();
    if let Ok(url) = std::env::var("STEPGRAPH_SQLITE_URL") {
        return url;
    }
    let name = std::env::var("SQLITE_DB_NAME").unwrap_or_else(|_| "stepgraph.db".to_string());
    format!("sqlite://{name}?mode=rwc")
}
