/*!
SQLite checkpoint saver.

Durable implementation of the [`CheckpointSaver`] trait backed by `sqlx`.
Stores full checkpoint history per `(thread_id, checkpoint_ns)` plus the
pending-writes table used for crash-safe task redelivery.

## Behavior

- Checkpoints and metadata are serialized through serde to JSON columns;
  pure serialization stays out of this module.
- The schema is created idempotently on connect.
- `checkpoint_id` is a time-ordered UUID rendered as fixed-width hex, so
  `ORDER BY checkpoint_id DESC` yields newest-first without an extra index.
- Pending writes are keyed by `(task_id, channel, idx)`; redelivered
  duplicates are ignored at insert.

## Storage growth

This backend stores complete history. Plan periodic cleanup for long-running
deployments, e.g.:

```bash
sqlite3 graph.db "DELETE FROM checkpoints WHERE created_at < datetime('now', '-30 days')"
sqlite3 graph.db "VACUUM"
```
*/

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use super::saver::{
    metadata_matches, CheckpointSaver, CheckpointTuple, ListOptions, PendingWrite, Result,
    SaverError,
};
use super::{Checkpoint, CheckpointConfig, CheckpointMetadata, ChannelVersions};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id      TEXT NOT NULL,
    checkpoint_ns  TEXT NOT NULL DEFAULT '',
    checkpoint_id  TEXT NOT NULL,
    parent_id      TEXT,
    checkpoint_json TEXT NOT NULL,
    metadata_json  TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id)
);
CREATE TABLE IF NOT EXISTS checkpoint_writes (
    thread_id      TEXT NOT NULL,
    checkpoint_ns  TEXT NOT NULL DEFAULT '',
    checkpoint_id  TEXT NOT NULL,
    task_id        TEXT NOT NULL,
    channel        TEXT NOT NULL,
    idx            INTEGER NOT NULL,
    value_json     TEXT NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_ns, checkpoint_id, task_id, channel, idx)
);
";

/// SQLite-backed checkpoint saver with full history.
pub struct SqliteSaver {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSaver").finish()
    }
}

fn backend(e: sqlx::Error) -> SaverError {
    SaverError::Backend {
        message: e.to_string(),
    }
}

impl SqliteSaver {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://graph.db?mode=rwc` or `sqlite::memory:`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await.map_err(backend)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self { pool })
    }

    async fn load_writes(
        &self,
        config: &CheckpointConfig,
        checkpoint_id: &str,
    ) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            "SELECT task_id, channel, idx, value_json FROM checkpoint_writes \
             WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3 \
             ORDER BY task_id, idx",
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(checkpoint_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let task_id: String = row.get("task_id");
            let task_id = Uuid::parse_str(&task_id).map_err(|e| SaverError::Other {
                message: format!("corrupt task id: {e}"),
            })?;
            let value_json: String = row.get("value_json");
            writes.push(PendingWrite {
                task_id,
                channel: row.get("channel"),
                idx: row.get::<i64, _>("idx") as usize,
                value: serde_json::from_str(&value_json)?,
            });
        }
        Ok(writes)
    }

    async fn row_to_tuple(
        &self,
        config: &CheckpointConfig,
        row: &sqlx::sqlite::SqliteRow,
    ) -> Result<CheckpointTuple> {
        let checkpoint_json: String = row.get("checkpoint_json");
        let metadata_json: String = row.get("metadata_json");
        let checkpoint: Checkpoint = serde_json::from_str(&checkpoint_json)?;
        let metadata: CheckpointMetadata = serde_json::from_str(&metadata_json)?;
        let checkpoint_id: String = row.get("checkpoint_id");
        let parent_id: Option<String> = row.get("parent_id");

        let pending_writes = self.load_writes(config, &checkpoint_id).await?;
        let parent_config = parent_id
            .as_deref()
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|e| SaverError::Other {
                message: format!("corrupt parent id: {e}"),
            })?
            .map(|pid| CheckpointConfig {
                thread_id: config.thread_id.clone(),
                checkpoint_ns: config.checkpoint_ns.clone(),
                checkpoint_id: Some(pid),
            });

        Ok(CheckpointTuple {
            config: CheckpointConfig {
                thread_id: config.thread_id.clone(),
                checkpoint_ns: config.checkpoint_ns.clone(),
                checkpoint_id: Some(checkpoint.id),
            },
            checkpoint,
            metadata,
            parent_config,
            pending_writes,
        })
    }
}

#[async_trait]
impl CheckpointSaver for SqliteSaver {
    #[instrument(skip(self), err)]
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let row = match config.checkpoint_id {
            Some(id) => sqlx::query(
                "SELECT checkpoint_id, parent_id, checkpoint_json, metadata_json \
                 FROM checkpoints \
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id = ?3",
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
            None => sqlx::query(
                "SELECT checkpoint_id, parent_id, checkpoint_json, metadata_json \
                 FROM checkpoints \
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 \
                 ORDER BY checkpoint_id DESC LIMIT 1",
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?,
        };
        match row {
            Some(row) => Ok(Some(self.row_to_tuple(config, &row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, options), err)]
    async fn list(
        &self,
        config: &CheckpointConfig,
        options: &ListOptions,
    ) -> Result<Vec<CheckpointTuple>> {
        let rows = match options.before {
            Some(before) => sqlx::query(
                "SELECT checkpoint_id, parent_id, checkpoint_json, metadata_json \
                 FROM checkpoints \
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 AND checkpoint_id < ?3 \
                 ORDER BY checkpoint_id DESC",
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .bind(before.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?,
            None => sqlx::query(
                "SELECT checkpoint_id, parent_id, checkpoint_json, metadata_json \
                 FROM checkpoints \
                 WHERE thread_id = ?1 AND checkpoint_ns = ?2 \
                 ORDER BY checkpoint_id DESC",
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?,
        };

        let mut out = Vec::new();
        for row in rows {
            if let Some(filter) = &options.filter {
                let metadata_json: String = row.get("metadata_json");
                let meta: serde_json::Value = serde_json::from_str(&metadata_json)?;
                if !metadata_matches(filter, &meta) {
                    continue;
                }
            }
            out.push(self.row_to_tuple(config, &row).await?);
            if options.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, checkpoint, metadata, _new_versions), err)]
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let id = checkpoint.id;
        let parent_id = match config.checkpoint_id {
            Some(pid) => Some(pid),
            // Without an explicit parent pin, chain onto the current head.
            None => self
                .get_tuple(&config.clone().latest())
                .await?
                .map(|t| t.checkpoint.id),
        };
        let checkpoint_json = serde_json::to_string(&checkpoint)?;
        let metadata_json = serde_json::to_string(&metadata)?;

        sqlx::query(
            "INSERT INTO checkpoints \
             (thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint_json, metadata_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&config.thread_id)
        .bind(&config.checkpoint_ns)
        .bind(id.to_string())
        .bind(parent_id.map(|p| p.to_string()))
        .bind(checkpoint_json)
        .bind(metadata_json)
        .bind(checkpoint.ts.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_ns: config.checkpoint_ns.clone(),
            checkpoint_id: Some(id),
        })
    }

    #[instrument(skip(self, writes), err)]
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<PendingWrite>,
        _task_id: Uuid,
    ) -> Result<()> {
        let Some(checkpoint_id) = config.checkpoint_id else {
            return Err(SaverError::Other {
                message: "put_writes requires a pinned checkpoint_id".to_string(),
            });
        };
        for write in writes {
            let value_json = serde_json::to_string(&write.value)?;
            // INSERT OR IGNORE dedups redelivered writes on the primary key.
            sqlx::query(
                "INSERT OR IGNORE INTO checkpoint_writes \
                 (thread_id, checkpoint_ns, checkpoint_id, task_id, channel, idx, value_json) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&config.thread_id)
            .bind(&config.checkpoint_ns)
            .bind(checkpoint_id.to_string())
            .bind(write.task_id.to_string())
            .bind(&write.channel)
            .bind(write.idx as i64)
            .bind(value_json)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn copy_thread(&self, src_thread_id: &str, dst_thread_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO checkpoints \
             (thread_id, checkpoint_ns, checkpoint_id, parent_id, checkpoint_json, metadata_json, created_at) \
             SELECT ?2, checkpoint_ns, checkpoint_id, parent_id, checkpoint_json, metadata_json, created_at \
             FROM checkpoints WHERE thread_id = ?1",
        )
        .bind(src_thread_id)
        .bind(dst_thread_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        sqlx::query(
            "INSERT OR IGNORE INTO checkpoint_writes \
             (thread_id, checkpoint_ns, checkpoint_id, task_id, channel, idx, value_json) \
             SELECT ?2, checkpoint_ns, checkpoint_id, task_id, channel, idx, value_json \
             FROM checkpoint_writes WHERE thread_id = ?1",
        )
        .bind(src_thread_id)
        .bind(dst_thread_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}
