//! Task selection for the upcoming superstep.
//!
//! Tasks come from two sources, in order: PUSH tasks materialized from the
//! checkpoint's pending sends, then PULL tasks for every candidate node.
//! Selection is a pure function of the checkpoint, the channels, and the
//! pending-writes table — no wall clock, no map iteration order.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use uuid::Uuid;

use crate::channels::Channel;
use crate::checkpoint::{Checkpoint, PendingWrite};
use crate::node::{ChannelRead, NodeSpec};
use crate::types::{TaskKind, ERROR, INTERRUPT, NULL_TASK_ID, RESUME};

/// Deterministic sort key: kind, discriminator, name.
pub type TaskPath = (String, String, String);

/// A unit of work selected for one superstep.
#[derive(Clone, Debug)]
pub struct Task {
    /// Stable identity across retries and crash re-runs.
    pub id: Uuid,
    pub name: String,
    /// Assembled input (channel read for PULL, packet args for PUSH).
    pub input: Value,
    pub kind: TaskKind,
    pub path: TaskPath,
    /// Triggers this task consumed (empty for PUSH).
    pub triggers: Vec<String>,
    /// Excluded from `*` interrupt matching.
    pub hidden: bool,
    /// Resume values redelivered from pending writes.
    pub resume: Vec<Value>,
    /// Writes recorded by a prior crashed run of this task. When set, the
    /// task is not executed again; the writes are committed as-is.
    pub recorded_writes: Option<Vec<(String, Value)>>,
}

/// Derive the stable task id from the canonical path tuple.
///
/// UUIDv5 over `(namespace = checkpoint id, key = JSON of
/// [checkpoint_ns, step, name, kind, discriminator])` — identical across
/// retries so pending-writes dedup holds.
#[must_use]
pub fn task_id(
    checkpoint_id: Uuid,
    checkpoint_ns: &str,
    step: i64,
    name: &str,
    kind: &TaskKind,
    discriminator: &str,
) -> Uuid {
    let key = serde_json::to_vec(&serde_json::json!([
        checkpoint_ns,
        step,
        name,
        kind.as_str(),
        discriminator
    ]))
    .unwrap_or_default();
    Uuid::new_v5(&checkpoint_id, &key)
}

/// Index over a checkpoint's pending writes, built once per prepare so task
/// preparation stays O(1) per candidate.
#[derive(Debug, Default)]
pub struct PendingWriteIndex {
    /// Resume value addressed to no specific task.
    pub null_resume: Option<Value>,
    /// Resume values per task, in write order.
    pub resume_by_task: FxHashMap<Uuid, Vec<Value>>,
    /// Tasks whose writes already committed in a prior (crashed) step —
    /// never re-run.
    pub successful: FxHashSet<Uuid>,
    /// Tasks that suspended with an interrupt.
    pub interrupted: FxHashSet<Uuid>,
    /// All recorded writes per task, for redelivery at commit.
    pub writes_by_task: FxHashMap<Uuid, Vec<(String, Value)>>,
}

/// Build the [`PendingWriteIndex`].
#[must_use]
pub fn index_pending_writes(writes: &[PendingWrite]) -> PendingWriteIndex {
    let mut index = PendingWriteIndex::default();
    for write in writes {
        match write.channel.as_str() {
            RESUME => {
                if write.task_id == NULL_TASK_ID {
                    index.null_resume = Some(write.value.clone());
                } else {
                    index
                        .resume_by_task
                        .entry(write.task_id)
                        .or_default()
                        .push(write.value.clone());
                }
            }
            INTERRUPT => {
                index.interrupted.insert(write.task_id);
            }
            ERROR => {}
            _ => {
                index.successful.insert(write.task_id);
                index
                    .writes_by_task
                    .entry(write.task_id)
                    .or_default()
                    .push((write.channel.clone(), write.value.clone()));
            }
        }
    }
    index
}

/// Inputs to [`prepare_next_tasks`].
pub struct PrepareContext<'a> {
    pub checkpoint: &'a Checkpoint,
    pub pending_writes: &'a [PendingWrite],
    pub nodes: &'a FxHashMap<String, NodeSpec>,
    pub channels: &'a FxHashMap<String, Channel>,
    pub checkpoint_ns: &'a str,
    pub step: i64,
    /// When false, inputs are still assembled but resume redelivery is
    /// skipped (used to compute `next` for state inspection).
    pub for_execution: bool,
    /// Optional restriction: only consider nodes listening on these
    /// channels. Must not change the result, only the work done.
    pub updated_channels: Option<&'a FxHashSet<String>>,
    pub trigger_to_nodes: Option<&'a FxHashMap<String, Vec<String>>>,
}

/// Assemble a node's input per its channel-read rule. `None` means the task
/// is skipped (no subscribed channel available).
fn assemble_input(spec: &NodeSpec, channels: &FxHashMap<String, Channel>) -> Option<Value> {
    let raw = match &spec.channels {
        ChannelRead::First(names) => names
            .iter()
            .find_map(|name| channels.get(name).and_then(|c| c.get(name).ok()))?,
        ChannelRead::Object(pairs) => {
            let mut object = serde_json::Map::new();
            for (alias, channel) in pairs {
                if let Some(value) = channels.get(channel).and_then(|c| c.get(channel).ok()) {
                    object.insert(alias.clone(), value);
                }
            }
            Value::Object(object)
        }
    };
    Some(match &spec.mapper {
        Some(mapper) => mapper(raw),
        None => raw,
    })
}

fn resume_for(index: &PendingWriteIndex, id: Uuid) -> Vec<Value> {
    if let Some(values) = index.resume_by_task.get(&id) {
        values.clone()
    } else if index.interrupted.contains(&id) {
        index.null_resume.clone().into_iter().collect()
    } else {
        Vec::new()
    }
}

/// Produce the task set for the upcoming superstep.
///
/// PULL candidates are enumerated in sorted node-name order with trigger
/// ties broken by declaration order; PUSH tasks preserve send insertion
/// order. Tasks whose writes already committed in a crashed step are not
/// executed again: for execution they re-enter carrying their recorded
/// writes, for inspection they are dropped.
#[must_use]
pub fn prepare_next_tasks(ctx: &PrepareContext<'_>) -> Vec<Task> {
    let index = index_pending_writes(ctx.pending_writes);
    let mut tasks = Vec::new();

    // 1. PUSH tasks from pending sends, FIFO.
    for (idx, send) in ctx.checkpoint.pending_sends.iter().enumerate() {
        let Some(spec) = ctx.nodes.get(&send.node) else {
            tracing::warn!(
                target: "stepgraph::algo",
                node = %send.node,
                "ignoring send to unknown node"
            );
            continue;
        };
        let id = task_id(
            ctx.checkpoint.id,
            ctx.checkpoint_ns,
            ctx.step,
            &send.node,
            &TaskKind::Push,
            &idx.to_string(),
        );
        let recorded_writes = recorded_for(&index, id, ctx.for_execution);
        if index.successful.contains(&id) && !ctx.for_execution {
            continue;
        }
        let input = match &spec.mapper {
            Some(mapper) => mapper(send.args.clone()),
            None => send.args.clone(),
        };
        tasks.push(Task {
            id,
            name: send.node.clone(),
            input,
            kind: TaskKind::Push,
            path: (
                TaskKind::Push.as_str().to_string(),
                idx.to_string(),
                send.node.clone(),
            ),
            triggers: Vec::new(),
            hidden: spec.is_hidden(),
            resume: if ctx.for_execution {
                resume_for(&index, id)
            } else {
                Vec::new()
            },
            recorded_writes,
        });
    }

    // 2. PULL tasks for candidate nodes, in sorted name order.
    let mut candidates: Vec<&str> = match (ctx.updated_channels, ctx.trigger_to_nodes) {
        (Some(updated), Some(trigger_to_nodes)) => {
            let mut names: Vec<&str> = updated
                .iter()
                .filter_map(|c| trigger_to_nodes.get(c))
                .flatten()
                .map(String::as_str)
                .collect();
            names.sort_unstable();
            names.dedup();
            names
        }
        _ => {
            let mut names: Vec<&str> = ctx.nodes.keys().map(String::as_str).collect();
            names.sort_unstable();
            names
        }
    };
    candidates.retain(|name| ctx.nodes.contains_key(*name));

    for name in candidates {
        let spec = &ctx.nodes[name];
        let seen = ctx.checkpoint.versions_seen.get(name);
        // Candidate iff some trigger is both available and newer than the
        // version this node last observed.
        let fired = spec.triggers.iter().find(|trigger| {
            let Some(version) = ctx.checkpoint.channel_versions.get(*trigger) else {
                return false;
            };
            let newer = match seen.and_then(|s| s.get(*trigger)) {
                Some(observed) => version > observed,
                None => true,
            };
            newer
                && ctx
                    .channels
                    .get(*trigger)
                    .is_some_and(Channel::is_available)
        });
        let Some(trigger) = fired else {
            continue;
        };
        let Some(input) = assemble_input(spec, ctx.channels) else {
            continue;
        };
        let id = task_id(
            ctx.checkpoint.id,
            ctx.checkpoint_ns,
            ctx.step,
            name,
            &TaskKind::Pull,
            trigger,
        );
        let recorded_writes = recorded_for(&index, id, ctx.for_execution);
        if index.successful.contains(&id) && !ctx.for_execution {
            continue;
        }
        tasks.push(Task {
            id,
            name: name.to_string(),
            input,
            kind: TaskKind::Pull,
            path: (
                TaskKind::Pull.as_str().to_string(),
                trigger.clone(),
                name.to_string(),
            ),
            triggers: spec.triggers.clone(),
            hidden: spec.is_hidden(),
            resume: if ctx.for_execution {
                resume_for(&index, id)
            } else {
                Vec::new()
            },
            recorded_writes,
        });
    }

    tasks
}

/// For execution, a task that already completed in a crashed step carries
/// its recorded writes instead of running again. For inspection (`next`
/// computation), completed tasks are dropped entirely by the caller.
fn recorded_for(
    index: &PendingWriteIndex,
    id: Uuid,
    for_execution: bool,
) -> Option<Vec<(String, Value)>> {
    if for_execution && index.successful.contains(&id) {
        Some(index.writes_by_task.get(&id).cloned().unwrap_or_default())
    } else {
        None
    }
}
