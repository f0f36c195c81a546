//! Concurrent execution of one superstep's tasks.
//!
//! Tasks progress in parallel up to the concurrency budget, with per-task
//! retry, cooperative cancellation over the three chained abort signals,
//! and dynamic PUSH children scheduled through the injected `call` hook.
//! Tasks never mutate channels — they accumulate writes into their own
//! buffer, which the loop commits at the barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::algo::read::local_read;
use crate::algo::prepare::{task_id, Task};
use crate::channels::Channel;
use crate::checkpoint::{CheckpointConfig, CheckpointSaver, PendingWrite};
use crate::control::{Command, CommandGraph, Goto, Interrupt};
use crate::graphs::edges::{trigger_channel, EdgeWriter};
use crate::node::{DynamicCall, InterruptScratchpad, NodeContext, NodeError, NodeSpec};
use crate::store::Store;
use crate::stream::{StreamPayload, StreamSender};
use crate::types::{TaskKind, ERROR, INTERRUPT, NO_WRITES, RETURN, TASKS};

use super::cancellation::{AbortKind, AbortSignals};
use super::retry::RetryPolicy;

/// How a task settled.
#[derive(Clone, Debug)]
pub enum TaskResult {
    Success,
    Interrupted(Vec<Interrupt>),
    ParentCommand(Box<Command>),
    Errored(String),
    Cancelled(AbortKind),
}

/// A settled task with its buffered writes (markers included).
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub task: Task,
    pub writes: Vec<(String, Value)>,
    pub result: TaskResult,
}

/// Shared environment for one superstep's execution.
#[derive(Clone)]
pub struct RunnerEnv {
    pub nodes: Arc<FxHashMap<String, NodeSpec>>,
    /// Read-only channel snapshot for fresh-state reads by writers.
    pub channels: Arc<FxHashMap<String, Channel>>,
    /// State fields conditional edges observe.
    pub state_fields: Arc<Vec<String>>,
    pub step: i64,
    pub thread_id: String,
    pub checkpoint_ns: String,
    pub checkpoint_id: Uuid,
    pub emitter: Option<StreamSender>,
    pub store: Option<Arc<dyn Store>>,
    pub signals: AbortSignals,
    /// Where settled writes are persisted for crash-safe redelivery.
    pub saver: Option<(Arc<dyn CheckpointSaver>, CheckpointConfig)>,
    /// Writes already recorded by a prior crashed step, for child dedup.
    pub recorded_writes: Arc<FxHashMap<Uuid, Vec<(String, Value)>>>,
    pub default_retry: RetryPolicy,
}

/// Executes the tasks of one superstep.
pub struct TaskRunner {
    max_concurrency: usize,
}

impl TaskRunner {
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Drive all tasks to settlement and return their outcomes, including
    /// any dynamically spawned children.
    pub async fn run_superstep(&self, tasks: Vec<Task>, env: RunnerEnv) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let children: Arc<Mutex<Vec<TaskOutcome>>> = Arc::new(Mutex::new(Vec::new()));
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();

        for task in tasks {
            let env = env.clone();
            let semaphore = Arc::clone(&semaphore);
            let children = Arc::clone(&children);
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                if let Some(kind) = env.signals.aborted() {
                    return TaskOutcome {
                        task,
                        writes: Vec::new(),
                        result: TaskResult::Cancelled(kind),
                    };
                }
                run_task(task, &env, &children).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if matches!(outcome.result, TaskResult::Errored(_)) {
                        // Siblings should abort cooperatively.
                        env.signals.exception.set();
                    }
                    persist_writes(&env, outcome.task.id, &outcome.writes).await;
                    outcomes.push(outcome);
                }
                Err(join_err) => {
                    tracing::error!(target: "stepgraph::runner", %join_err, "task panicked");
                    env.signals.exception.set();
                }
            }
        }

        outcomes.extend(children.lock().drain(..));
        outcomes
    }
}

async fn persist_writes(env: &RunnerEnv, task: Uuid, writes: &[(String, Value)]) {
    let Some((saver, config)) = &env.saver else {
        return;
    };
    let rows: Vec<PendingWrite> = writes
        .iter()
        .enumerate()
        .map(|(idx, (channel, value))| PendingWrite {
            task_id: task,
            channel: channel.clone(),
            value: value.clone(),
            idx,
        })
        .collect();
    if rows.is_empty() {
        return;
    }
    if let Err(err) = saver.put_writes(config, rows, task).await {
        tracing::warn!(target: "stepgraph::runner", %err, "failed to persist task writes");
    }
}

fn debug_event(env: &RunnerEnv, event: &str, payload: Value) {
    if let Some(emitter) = &env.emitter {
        let _ = emitter.emit(StreamPayload::Debug {
            step: env.step,
            event: event.to_string(),
            payload,
        });
    }
}

async fn run_task(
    task: Task,
    env: &RunnerEnv,
    children: &Arc<Mutex<Vec<TaskOutcome>>>,
) -> TaskOutcome {
    // A prior crashed run already produced this task's writes; commit them
    // without executing again.
    if let Some(recorded) = task.recorded_writes.clone() {
        return TaskOutcome {
            task,
            writes: recorded,
            result: TaskResult::Success,
        };
    }
    let Some(spec) = env.nodes.get(&task.name).cloned() else {
        return TaskOutcome {
            task,
            writes: vec![(ERROR.to_string(), json!("unknown node"))],
            result: TaskResult::Errored("unknown node".to_string()),
        };
    };
    debug_event(
        env,
        "task_start",
        json!({"task_id": task.id, "node": task.name}),
    );

    let scratchpad = InterruptScratchpad::with_resume(task.resume.clone());
    let retry = spec
        .retry_policy
        .clone()
        .unwrap_or_else(|| env.default_retry.clone());

    let caller: Arc<dyn DynamicCall> = Arc::new(CallHandle {
        env: env.clone(),
        children: Arc::clone(children),
        parent_task: task.id,
        counter: AtomicUsize::new(0),
    });

    let mut attempt: u32 = 0;
    let outcome = loop {
        attempt += 1;
        scratchpad.rewind();
        let ctx = NodeContext {
            node: task.name.clone(),
            step: env.step,
            task_id: task.id,
            thread_id: env.thread_id.clone(),
            checkpoint_ns: env.checkpoint_ns.clone(),
            emitter: env.emitter.clone(),
            scratchpad: scratchpad.clone(),
            caller: Some(Arc::clone(&caller)),
            store: env.store.clone(),
        };

        let run = spec.node.run(task.input.clone(), ctx);
        let result = tokio::select! {
            biased;
            kind = env.signals.wait_any() => Err((NodeError::Cancelled, Some(kind))),
            result = run => result.map_err(|e| (e, None)),
        };

        match result {
            Ok(output) => break settle_success(&task, &spec, env, output),
            Err((NodeError::Interrupt(interrupts), _)) => {
                break TaskOutcome {
                    writes: vec![(INTERRUPT.to_string(), json!(interrupts))],
                    result: TaskResult::Interrupted(interrupts),
                    task,
                };
            }
            Err((NodeError::ParentCommand(command), _)) => {
                break TaskOutcome {
                    task,
                    writes: Vec::new(),
                    result: TaskResult::ParentCommand(command),
                };
            }
            Err((NodeError::Cancelled, kind)) => {
                let kind = kind
                    .or_else(|| env.signals.aborted())
                    .unwrap_or(AbortKind::External);
                break TaskOutcome {
                    task,
                    writes: Vec::new(),
                    result: TaskResult::Cancelled(kind),
                };
            }
            Err((err, _)) => {
                if retry.should_retry(attempt, &err) {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        target: "stepgraph::runner",
                        node = %task.name,
                        attempt,
                        %err,
                        "task failed; retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        kind = env.signals.wait_any() => {
                            break TaskOutcome {
                                task,
                                writes: Vec::new(),
                                result: TaskResult::Cancelled(kind),
                            };
                        }
                    }
                }
                let message = err.to_string();
                break TaskOutcome {
                    task,
                    writes: vec![(ERROR.to_string(), json!(message))],
                    result: TaskResult::Errored(message),
                };
            }
        }
    };

    debug_event(
        env,
        "task_end",
        json!({
            "task_id": outcome.task.id,
            "node": outcome.task.name,
            "writes": outcome.writes.len(),
        }),
    );
    outcome
}

/// Turn a successful node output into the task's write buffer, applying the
/// node's writers (static edges, barrier contributions, branches).
fn settle_success(
    task: &Task,
    spec: &NodeSpec,
    env: &RunnerEnv,
    output: crate::node::NodeOutput,
) -> TaskOutcome {
    let mut writes: Vec<(String, Value)> = Vec::new();
    match output {
        crate::node::NodeOutput::Updates(updates) => writes.extend(updates),
        crate::node::NodeOutput::Command(command) => {
            if command.graph == CommandGraph::Parent {
                return TaskOutcome {
                    task: task.clone(),
                    writes: Vec::new(),
                    result: TaskResult::ParentCommand(Box::new(command)),
                };
            }
            writes.extend(command.update.clone());
            for goto in &command.goto {
                push_goto(&mut writes, goto, env);
            }
        }
    }

    for writer in &spec.writers {
        match writer {
            EdgeWriter::To(target) => {
                writes.push((trigger_channel(target), Value::Null));
            }
            EdgeWriter::Join { channel } => {
                writes.push((channel.clone(), json!(task.name)));
            }
            EdgeWriter::Branch(edge) => {
                // Branches observe the writer's own updates.
                let fresh = local_read(&env.channels, &env.state_fields, &writes, true)
                    .map(|values| Value::Object(values.into_iter().collect()))
                    .unwrap_or(Value::Null);
                for goto in (edge.predicate)(&fresh) {
                    push_goto(&mut writes, &goto, env);
                }
            }
        }
    }

    if writes.is_empty() {
        writes.push((NO_WRITES.to_string(), Value::Null));
    }
    TaskOutcome {
        task: task.clone(),
        writes,
        result: TaskResult::Success,
    }
}

fn push_goto(writes: &mut Vec<(String, Value)>, goto: &Goto, env: &RunnerEnv) {
    match goto {
        Goto::Node(target) if target == crate::types::END => {}
        Goto::Node(target) => {
            if env.nodes.contains_key(target) {
                writes.push((trigger_channel(target), Value::Null));
            } else {
                tracing::warn!(
                    target: "stepgraph::runner",
                    node = %target,
                    "routing target does not exist; skipping"
                );
            }
        }
        Goto::Send(packet) => match serde_json::to_value(packet) {
            Ok(value) => writes.push((TASKS.to_string(), value)),
            Err(err) => {
                tracing::warn!(target: "stepgraph::runner", %err, "unserializable send packet");
            }
        },
    }
}

/// Dynamic-call hook: schedules a child PUSH task inline, deduplicated by
/// id, and returns its recorded return value.
struct CallHandle {
    env: RunnerEnv,
    children: Arc<Mutex<Vec<TaskOutcome>>>,
    parent_task: Uuid,
    counter: AtomicUsize,
}

fn return_value_of(writes: &[(String, Value)]) -> Value {
    writes
        .iter()
        .find(|(channel, _)| channel == RETURN)
        .map(|(_, value)| value.clone())
        .unwrap_or(Value::Null)
}

#[async_trait::async_trait]
impl DynamicCall for CallHandle {
    async fn call(&self, node: &str, input: Value) -> Result<Value, NodeError> {
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        let discriminator = format!("{}:{idx}", self.parent_task);
        let child_id = task_id(
            self.env.checkpoint_id,
            &self.env.checkpoint_ns,
            self.env.step,
            node,
            &TaskKind::Push,
            &discriminator,
        );

        // A crashed step may already have this child's result.
        if let Some(recorded) = self.env.recorded_writes.get(&child_id) {
            return Ok(return_value_of(recorded));
        }

        if !self.env.nodes.contains_key(node) {
            return Err(NodeError::Other(format!("unknown node `{node}`")));
        }
        let child = Task {
            id: child_id,
            name: node.to_string(),
            input,
            kind: TaskKind::Push,
            path: (
                TaskKind::Push.as_str().to_string(),
                discriminator,
                node.to_string(),
            ),
            triggers: Vec::new(),
            hidden: self.env.nodes[node].is_hidden(),
            resume: Vec::new(),
            recorded_writes: None,
        };

        // Runs within the parent's concurrency slot; the parent is parked on
        // this future while the child makes progress.
        let outcome = Box::pin(run_task(child, &self.env, &self.children)).await;
        persist_writes(&self.env, outcome.task.id, &outcome.writes).await;

        let result = match &outcome.result {
            TaskResult::Success => Ok(return_value_of(&outcome.writes)),
            TaskResult::Interrupted(interrupts) => {
                Err(NodeError::Interrupt(interrupts.clone()))
            }
            TaskResult::ParentCommand(command) => {
                Err(NodeError::ParentCommand(command.clone()))
            }
            TaskResult::Errored(message) => Err(NodeError::Other(message.clone())),
            TaskResult::Cancelled(_) => Err(NodeError::Cancelled),
        };
        self.children.lock().push(outcome);
        result
    }
}
