//! The superstep loop.
//!
//! `AppRunner` drives one invocation through the Pregel cycle: load (or
//! create) a checkpoint, prepare the next task set, gate on interrupts,
//! run the tasks, commit their writes, persist, repeat. The cycle ends when
//! no task is scheduled, an interrupt fires, or the recursion limit is
//! reached.
//!
//! Channels are mutated only on this loop's fiber; the snapshot handed to
//! the task runner is a clone, so tasks observe a frozen state while the
//! commit stays deterministic.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use crate::algo::{
    apply_writes, index_pending_writes, mark_interrupt_seen, prepare_next_tasks, should_interrupt,
    CommittedTask, PrepareContext,
};
use crate::app::App;
use crate::channels::{Channel, ChannelError};
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource, PendingWrite, SaverError,
};
use crate::control::{Command, Interrupt, ResumeValue};
use crate::graphs::edges::EdgeWriter;
use crate::graphs::GraphCompileError;
use crate::stream::{StreamHub, StreamMode, StreamPayload};
use crate::types::{ChannelVersion, NULL_TASK_ID, RESUME, START, TASKS};

use super::cancellation::{AbortKind, AbortSignal, AbortSignals};
use super::runtime_config::RuntimeConfig;
use super::task_runner::{RunnerEnv, TaskOutcome, TaskResult, TaskRunner};

/// What an invocation starts from.
#[derive(Clone, Debug)]
pub enum GraphInput {
    /// Fresh input applied through the state schema.
    Start(Value),
    /// A command: resume value and/or state patch and routing.
    Command(Command),
    /// Continue from the thread's checkpoint without new input.
    Resume,
}

impl From<Value> for GraphInput {
    fn from(value: Value) -> Self {
        GraphInput::Start(value)
    }
}

impl From<Command> for GraphInput {
    fn from(command: Command) -> Self {
        GraphInput::Command(command)
    }
}

/// How an invocation ended.
#[derive(Clone, Debug)]
pub enum GraphOutput {
    /// Ran to completion; the final aggregated state values.
    Complete(FxHashMap<String, Value>),
    /// Suspended. Dynamic interrupts carry their payloads; static
    /// interrupt-before/after suspensions carry none.
    Interrupted(Vec<Interrupt>),
}

impl GraphOutput {
    /// The final values, when the invocation completed.
    #[must_use]
    pub fn values(&self) -> Option<&FxHashMap<String, Value>> {
        match self {
            GraphOutput::Complete(values) => Some(values),
            GraphOutput::Interrupted(_) => None,
        }
    }
}

/// Errors surfaced by the loop.
#[derive(Debug, Error, Diagnostic)]
pub enum LoopError {
    #[error("recursion limit of {limit} supersteps reached without convergence")]
    #[diagnostic(
        code(stepgraph::runner::recursion),
        help("Raise the recursion limit on the invocation config, or check the graph for cycles.")
    )]
    RecursionLimit { limit: usize },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Saver(#[from] SaverError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Input(#[from] GraphCompileError),

    #[error("node `{node}` failed: {message}")]
    #[diagnostic(code(stepgraph::runner::node))]
    NodeRun { node: String, message: String },

    #[error("multiple tasks failed: {messages:?}")]
    #[diagnostic(code(stepgraph::runner::aggregate))]
    MultipleErrors { messages: Vec<String> },

    /// Not an error at the user level: a `Command{graph: Parent}` bubbling
    /// out of a subgraph, caught at the boundary and re-applied.
    #[error("command addressed to the parent graph")]
    #[diagnostic(code(stepgraph::runner::parent_command))]
    ParentCommand(Box<Command>),

    #[error("invocation aborted ({kind:?})")]
    #[diagnostic(code(stepgraph::runner::cancelled))]
    Cancelled { kind: AbortKind },

    #[error("nothing to run: no input given and the thread has no checkpoint")]
    #[diagnostic(code(stepgraph::runner::empty_input))]
    EmptyInput,
}

/// Runtime execution engine for one compiled app.
///
/// A runner owns the stream hub for its invocations; create one per
/// consumer when events must be isolated.
pub struct AppRunner {
    app: Arc<App>,
    config: RuntimeConfig,
    hub: Arc<StreamHub>,
    external_abort: AbortSignal,
}

impl AppRunner {
    #[must_use]
    pub fn new(app: Arc<App>, config: RuntimeConfig) -> Self {
        Self {
            app,
            config,
            hub: StreamHub::new(),
            external_abort: AbortSignal::new(),
        }
    }

    /// The hub this runner emits to; subscribe before calling `run`.
    #[must_use]
    pub fn stream_hub(&self) -> Arc<StreamHub> {
        Arc::clone(&self.hub)
    }

    /// Handle the caller can fire to abort the invocation cooperatively.
    #[must_use]
    pub fn abort_signal(&self) -> AbortSignal {
        self.external_abort.clone()
    }

    fn emit(&self, mode: StreamMode, payload: StreamPayload) {
        if self.config.stream_modes.contains(&mode) {
            let _ = self.hub.emit(payload);
        }
    }

    /// Drive the invocation to completion, suspension, or error.
    #[instrument(skip(self, input), fields(thread_id), err)]
    pub async fn run(&self, input: GraphInput) -> Result<GraphOutput, LoopError> {
        let result = self.run_inner(input).await;
        self.hub.close();
        result
    }

    async fn run_inner(&self, input: GraphInput) -> Result<GraphOutput, LoopError> {
        let thread_id = self.config.resolved_thread_id();
        tracing::Span::current().record("thread_id", thread_id.as_str());
        let saver = self.app.saver();

        // LOAD_CHECKPOINT
        let base_config = self.config.checkpoint_config(&thread_id);
        let loaded = match &saver {
            Some(saver) => saver.get_tuple(&base_config).await?,
            None => None,
        };
        let (mut checkpoint, loaded_step, mut pending_writes, mut head_config) = match loaded {
            Some(tuple) => (
                tuple.checkpoint,
                tuple.metadata.step,
                tuple.pending_writes,
                tuple.config,
            ),
            None => (
                Checkpoint::empty(),
                -2,
                Vec::new(),
                base_config.clone(),
            ),
        };

        // Restore channels from the checkpoint over the compiled prototypes.
        let mut channels = self.app.base_channels();
        for (name, snapshot) in &checkpoint.channel_values {
            if let Some(proto) = channels.get(name) {
                let restored = proto.restore(name, snapshot.clone())?;
                channels.insert(name.clone(), restored);
            }
        }

        let mut step: i64 = loaded_step + 1;

        // Apply invocation input.
        match input {
            GraphInput::Start(value) => {
                let mut writes = self.app.schema().input_writes(value)?;
                self.extend_with_start_writers(&mut writes, &channels)?;
                self.commit_as(
                    START,
                    writes,
                    &mut checkpoint,
                    &mut channels,
                )?;
                checkpoint = advance(&checkpoint, &channels);
                head_config = self
                    .persist(
                        &saver,
                        &head_config,
                        &checkpoint,
                        CheckpointMetadata::new(CheckpointSource::Input, step),
                    )
                    .await?;
                pending_writes.clear();
                step += 1;
            }
            GraphInput::Command(command) => {
                if head_config.checkpoint_id.is_none() {
                    return Err(LoopError::EmptyInput);
                }
                if command.resume.is_some()
                    && (!command.update.is_empty() || !command.goto.is_empty())
                {
                    // A state patch creates a new checkpoint, re-keying the
                    // suspended tasks the resume value addresses.
                    tracing::warn!(
                        target: "stepgraph::loop",
                        "command combines resume with a state patch; the resume is delivered \
                         against the pre-patch checkpoint"
                    );
                }
                if let Some(resume) = &command.resume {
                    let rows = resume_rows(resume, &pending_writes);
                    if let Some(saver) = &saver {
                        saver
                            .put_writes(&head_config, rows.clone(), NULL_TASK_ID)
                            .await?;
                    }
                    pending_writes.extend(rows);
                }
                if !command.update.is_empty() || !command.goto.is_empty() {
                    let mut writes = command.update.clone();
                    for goto in &command.goto {
                        push_goto_write(&mut writes, goto);
                    }
                    self.commit_as(START, writes, &mut checkpoint, &mut channels)?;
                    checkpoint = advance(&checkpoint, &channels);
                    head_config = self
                        .persist(
                            &saver,
                            &head_config,
                            &checkpoint,
                            CheckpointMetadata::new(CheckpointSource::Input, step),
                        )
                        .await?;
                    pending_writes.clear();
                    step += 1;
                }
            }
            GraphInput::Resume => {
                if head_config.checkpoint_id.is_none() {
                    return Err(LoopError::EmptyInput);
                }
            }
        }

        // Superstep loop.
        let runner = TaskRunner::new(self.config.max_concurrency);
        let signals = AbortSignals {
            external: self.external_abort.clone(),
            ..AbortSignals::new()
        };
        let mut steps_taken: usize = 0;

        loop {
            let tasks = prepare_next_tasks(&PrepareContext {
                checkpoint: &checkpoint,
                pending_writes: &pending_writes,
                nodes: self.app.nodes(),
                channels: &channels,
                checkpoint_ns: &self.config.checkpoint_ns,
                step,
                for_execution: true,
                updated_channels: None,
                trigger_to_nodes: Some(self.app.trigger_to_nodes()),
            });
            if tasks.is_empty() {
                break;
            }
            // Reaching the limit is fine when every task already produced
            // writes in a crashed step: that commit is a fixed point, not
            // further progress.
            if steps_taken >= self.config.recursion_limit
                && tasks.iter().any(|t| t.recorded_writes.is_none())
            {
                return Err(LoopError::RecursionLimit {
                    limit: self.config.recursion_limit,
                });
            }

            // Interrupt-before: evaluated against the prepared task list.
            if should_interrupt(&checkpoint, self.app.interrupt_before(), &tasks) {
                mark_interrupt_seen(&mut checkpoint);
                checkpoint = advance(&checkpoint, &channels);
                self.persist(
                    &saver,
                    &head_config,
                    &checkpoint,
                    CheckpointMetadata::new(CheckpointSource::Loop, step),
                )
                .await?;
                return Ok(GraphOutput::Interrupted(Vec::new()));
            }

            // RUN_TASKS
            let step_signals = signals.next_step();
            let watchdog = self.config.step_timeout.map(|timeout| {
                let signal = step_signals.timeout.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    signal.set();
                })
            });
            let index = index_pending_writes(&pending_writes);
            let env = RunnerEnv {
                nodes: self.app.nodes_arc(),
                channels: Arc::new(channels.clone()),
                state_fields: self.app.state_fields(),
                step,
                thread_id: thread_id.clone(),
                checkpoint_ns: self.config.checkpoint_ns.clone(),
                checkpoint_id: checkpoint.id,
                emitter: Some(self.hub.sender()),
                store: self.app.store(),
                signals: step_signals.clone(),
                saver: saver
                    .clone()
                    .map(|s| (s, head_config.clone())),
                recorded_writes: Arc::new(index.writes_by_task),
                default_retry: self.app.default_retry().clone(),
            };
            let outcomes = runner.run_superstep(tasks.clone(), env).await;
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }

            // Settle control flow before committing anything.
            if let Some(command) = outcomes.iter().find_map(|o| match &o.result {
                TaskResult::ParentCommand(command) => Some(command.clone()),
                _ => None,
            }) {
                return Err(LoopError::ParentCommand(command));
            }

            let interrupts: Vec<Interrupt> = outcomes
                .iter()
                .filter_map(|o| match &o.result {
                    TaskResult::Interrupted(list) => Some(list.clone()),
                    _ => None,
                })
                .flatten()
                .collect();
            if !interrupts.is_empty() {
                // Completed siblings' writes are already persisted; the
                // resume re-runs only the interrupted tasks.
                return Ok(GraphOutput::Interrupted(interrupts));
            }

            if let Some(kind) = step_signals.aborted() {
                if matches!(kind, AbortKind::External | AbortKind::Timeout) {
                    return Err(LoopError::Cancelled { kind });
                }
            }

            let mut errors: Vec<(String, String)> = outcomes
                .iter()
                .filter_map(|o| match &o.result {
                    TaskResult::Errored(message) => {
                        Some((o.task.name.clone(), message.clone()))
                    }
                    _ => None,
                })
                .collect();
            if !errors.is_empty() {
                return Err(if errors.len() == 1 {
                    let (node, message) = errors.remove(0);
                    LoopError::NodeRun { node, message }
                } else {
                    LoopError::MultipleErrors {
                        messages: errors.into_iter().map(|(_, m)| m).collect(),
                    }
                });
            }

            // COMMIT_WRITES
            let committed: Vec<CommittedTask> = outcomes
                .iter()
                .map(|o| CommittedTask {
                    name: o.task.name.clone(),
                    path: o.task.path.clone(),
                    triggers: o.task.triggers.clone(),
                    writes: o.writes.clone(),
                })
                .collect();
            let commit = apply_writes(
                &mut checkpoint,
                &mut channels,
                &committed,
                self.app.next_version(),
                self.app.trigger_to_nodes(),
            )?;
            checkpoint.pending_sends = commit.new_sends;

            // PERSIST_CHECKPOINT
            checkpoint = advance(&checkpoint, &channels);
            let fire_after = should_interrupt(&checkpoint, self.app.interrupt_after(), &tasks);
            if fire_after {
                mark_interrupt_seen(&mut checkpoint);
            }
            let new_versions = commit
                .updated_channels
                .iter()
                .filter_map(|c| {
                    checkpoint
                        .channel_versions
                        .get(c)
                        .map(|v| (c.clone(), v.clone()))
                })
                .collect();
            head_config = self
                .persist_with_versions(
                    &saver,
                    &head_config,
                    &checkpoint,
                    CheckpointMetadata::new(CheckpointSource::Loop, step),
                    new_versions,
                )
                .await?;
            pending_writes.clear();

            self.emit(
                StreamMode::Updates,
                StreamPayload::Updates {
                    step,
                    updates: visible_updates(&outcomes, self.app.state_fields().as_slice()),
                },
            );
            self.emit(
                StreamMode::Values,
                StreamPayload::Values {
                    step,
                    values: self.app.schema().read_values(&channels),
                },
            );

            if fire_after {
                return Ok(GraphOutput::Interrupted(Vec::new()));
            }

            step += 1;
            steps_taken += 1;
        }

        Ok(GraphOutput::Complete(self.app.schema().read_values(&channels)))
    }

    /// Apply the start node's writers (entry edges, branches from start) to
    /// the input writes.
    fn extend_with_start_writers(
        &self,
        writes: &mut Vec<(String, Value)>,
        channels: &FxHashMap<String, Channel>,
    ) -> Result<(), LoopError> {
        for writer in self.app.start_writers() {
            match writer {
                EdgeWriter::To(target) => {
                    writes.push((crate::graphs::edges::trigger_channel(target), Value::Null));
                }
                EdgeWriter::Join { channel } => {
                    writes.push((channel.clone(), serde_json::json!(START)));
                }
                EdgeWriter::Branch(edge) => {
                    let fresh = crate::algo::local_read(
                        channels,
                        &self.app.state_fields(),
                        writes,
                        true,
                    )?;
                    let state = Value::Object(fresh.into_iter().collect());
                    for goto in (edge.predicate)(&state) {
                        push_goto_write(writes, &goto);
                    }
                }
            }
        }
        Ok(())
    }

    /// Commit writes attributed to a virtual node (input application and
    /// command patches).
    fn commit_as(
        &self,
        name: &str,
        writes: Vec<(String, Value)>,
        checkpoint: &mut Checkpoint,
        channels: &mut FxHashMap<String, Channel>,
    ) -> Result<(), LoopError> {
        let synthetic = CommittedTask {
            name: name.to_string(),
            path: (String::new(), String::new(), name.to_string()),
            triggers: Vec::new(),
            writes,
        };
        let commit = apply_writes(
            checkpoint,
            channels,
            std::slice::from_ref(&synthetic),
            self.app.next_version(),
            self.app.trigger_to_nodes(),
        )?;
        if !commit.new_sends.is_empty() {
            checkpoint.pending_sends.extend(commit.new_sends);
        }
        Ok(())
    }

    async fn persist(
        &self,
        saver: &Option<Arc<dyn crate::checkpoint::CheckpointSaver>>,
        head: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig, LoopError> {
        self.persist_with_versions(saver, head, checkpoint, metadata, FxHashMap::default())
            .await
    }

    async fn persist_with_versions(
        &self,
        saver: &Option<Arc<dyn crate::checkpoint::CheckpointSaver>>,
        head: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: FxHashMap<String, ChannelVersion>,
    ) -> Result<CheckpointConfig, LoopError> {
        match saver {
            Some(saver) => Ok(saver
                .put(head, checkpoint.clone(), metadata, new_versions)
                .await?),
            None => {
                let mut pinned = head.clone();
                pinned.checkpoint_id = Some(checkpoint.id);
                Ok(pinned)
            }
        }
    }
}

/// Carry a checkpoint forward over the current channel states, assigning a
/// fresh id.
fn advance(checkpoint: &Checkpoint, channels: &FxHashMap<String, Channel>) -> Checkpoint {
    Checkpoint::capture(
        channels,
        checkpoint.channel_versions.clone(),
        checkpoint.versions_seen.clone(),
        checkpoint.pending_sends.clone(),
    )
}

fn push_goto_write(writes: &mut Vec<(String, Value)>, goto: &crate::control::Goto) {
    match goto {
        crate::control::Goto::Node(target) if target == crate::types::END => {}
        crate::control::Goto::Node(target) => {
            writes.push((crate::graphs::edges::trigger_channel(target), Value::Null));
        }
        crate::control::Goto::Send(packet) => {
            if let Ok(value) = serde_json::to_value(packet) {
                writes.push((TASKS.to_string(), value));
            }
        }
    }
}

/// Rows delivering a resume value back into interrupted tasks.
fn resume_rows(resume: &ResumeValue, pending: &[PendingWrite]) -> Vec<PendingWrite> {
    match resume {
        ResumeValue::Single(value) => {
            // Address interrupted tasks directly when known, else leave a
            // null-task row the prepare index hands to any interrupted task.
            let mut interrupted: Vec<_> = pending
                .iter()
                .filter(|w| w.channel == crate::types::INTERRUPT)
                .map(|w| w.task_id)
                .collect();
            interrupted.sort();
            interrupted.dedup();
            if interrupted.is_empty() {
                vec![PendingWrite {
                    task_id: NULL_TASK_ID,
                    channel: RESUME.to_string(),
                    value: value.clone(),
                    idx: 0,
                }]
            } else {
                interrupted
                    .into_iter()
                    .map(|task_id| {
                        // Later answers to the same task take the next slot
                        // so the saver's dedup key does not swallow them.
                        let idx = pending
                            .iter()
                            .filter(|w| w.task_id == task_id && w.channel == RESUME)
                            .count();
                        PendingWrite {
                            task_id,
                            channel: RESUME.to_string(),
                            value: value.clone(),
                            idx,
                        }
                    })
                    .collect()
            }
        }
        ResumeValue::ByTask(entries) => entries
            .iter()
            .enumerate()
            .map(|(idx, (task_id, value))| PendingWrite {
                task_id: *task_id,
                channel: RESUME.to_string(),
                value: value.clone(),
                idx,
            })
            .collect(),
    }
}

/// Updates visible to stream consumers: per node, the writes landing on
/// state fields.
fn visible_updates(
    outcomes: &[TaskOutcome],
    state_fields: &[String],
) -> FxHashMap<String, Vec<(String, Value)>> {
    let mut updates: FxHashMap<String, Vec<(String, Value)>> = FxHashMap::default();
    for outcome in outcomes {
        let writes: Vec<(String, Value)> = outcome
            .writes
            .iter()
            .filter(|(channel, _)| state_fields.contains(channel))
            .cloned()
            .collect();
        if !writes.is_empty() {
            updates.entry(outcome.task.name.clone()).or_default().extend(writes);
        }
    }
    updates
}
