//! The compiled application.
//!
//! `App` is the immutable product of graph compilation: the node registry,
//! the channel prototypes, the routing indices, and the attached saver and
//! store. It exposes the engine-facing surface — invoke, stream, batch,
//! state inspection, state patching — and can itself be embedded as a node
//! of an enclosing graph.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::algo::{
    apply_writes, prepare_next_tasks, CommittedTask, InterruptNodes, PrepareContext,
};
use crate::channels::Channel;
use crate::checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    CheckpointTuple, ListOptions,
};
use crate::control::Command;
use crate::graphs::edges::EdgeWriter;
use crate::graphs::StateSchema;
use crate::node::{Node, NodeContext, NodeError, NodeOutput, NodeSpec};
use crate::runtimes::{
    AppRunner, GraphInput, GraphOutput, LoopError, RetryPolicy, RuntimeConfig,
};
use crate::store::Store;
use crate::stream::{EventStream, StreamMode};
use crate::types::{NextVersion, ERROR, INTERRUPT, NS_SEP, START};

/// Inspection view of a thread's state at one checkpoint.
#[derive(Clone, Debug)]
pub struct StateView {
    /// Aggregated state values.
    pub values: FxHashMap<String, Value>,
    /// Names of the tasks that would run next.
    pub next: Vec<String>,
    /// Config addressing this checkpoint.
    pub config: CheckpointConfig,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
    pub parent_config: Option<CheckpointConfig>,
    /// Pending task details (interrupts, recorded errors).
    pub tasks: Vec<TaskView>,
}

/// Pending-task detail inside a [`StateView`].
#[derive(Clone, Debug, Default)]
pub struct TaskView {
    pub id: Uuid,
    pub interrupts: Vec<Value>,
    pub error: Option<String>,
}

/// Orchestrates graph execution; see the module docs.
#[derive(Clone)]
pub struct App {
    schema: StateSchema,
    nodes: Arc<FxHashMap<String, NodeSpec>>,
    base_channels: FxHashMap<String, Channel>,
    start_writers: Arc<Vec<EdgeWriter>>,
    trigger_to_nodes: FxHashMap<String, Vec<String>>,
    interrupt_before: InterruptNodes,
    interrupt_after: InterruptNodes,
    saver: Option<Arc<dyn CheckpointSaver>>,
    store: Option<Arc<dyn Store>>,
    next_version: NextVersion,
    state_fields: Arc<Vec<String>>,
    default_retry: RetryPolicy,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        schema: StateSchema,
        nodes: FxHashMap<String, NodeSpec>,
        base_channels: FxHashMap<String, Channel>,
        start_writers: Vec<EdgeWriter>,
        trigger_to_nodes: FxHashMap<String, Vec<String>>,
        interrupt_before: InterruptNodes,
        interrupt_after: InterruptNodes,
        saver: Option<Arc<dyn CheckpointSaver>>,
        store: Option<Arc<dyn Store>>,
        next_version: NextVersion,
    ) -> Self {
        let state_fields = Arc::new(
            schema
                .field_names()
                .map(str::to_string)
                .collect::<Vec<_>>(),
        );
        Self {
            schema,
            nodes: Arc::new(nodes),
            base_channels,
            start_writers: Arc::new(start_writers),
            trigger_to_nodes,
            interrupt_before,
            interrupt_after,
            saver,
            store,
            next_version,
            state_fields,
            default_retry: RetryPolicy::default(),
        }
    }

    pub(crate) fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub(crate) fn nodes(&self) -> &FxHashMap<String, NodeSpec> {
        &self.nodes
    }

    pub(crate) fn nodes_arc(&self) -> Arc<FxHashMap<String, NodeSpec>> {
        Arc::clone(&self.nodes)
    }

    pub(crate) fn base_channels(&self) -> FxHashMap<String, Channel> {
        self.base_channels.clone()
    }

    pub(crate) fn start_writers(&self) -> &[EdgeWriter] {
        &self.start_writers
    }

    pub(crate) fn trigger_to_nodes(&self) -> &FxHashMap<String, Vec<String>> {
        &self.trigger_to_nodes
    }

    pub(crate) fn interrupt_before(&self) -> &InterruptNodes {
        &self.interrupt_before
    }

    pub(crate) fn interrupt_after(&self) -> &InterruptNodes {
        &self.interrupt_after
    }

    pub(crate) fn saver(&self) -> Option<Arc<dyn CheckpointSaver>> {
        self.saver.clone()
    }

    pub(crate) fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    pub(crate) fn next_version(&self) -> &NextVersion {
        &self.next_version
    }

    pub(crate) fn state_fields(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.state_fields)
    }

    pub(crate) fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    /// Execute to completion (or suspension) and return the outcome.
    #[instrument(skip(self, input, config), err)]
    pub async fn invoke(
        &self,
        input: impl Into<GraphInput>,
        config: RuntimeConfig,
    ) -> Result<GraphOutput, LoopError> {
        let runner = AppRunner::new(Arc::new(self.clone()), config);
        runner.run(input.into()).await
    }

    /// Execute while streaming events; returns the subscribed stream and a
    /// handle resolving to the invocation outcome.
    #[must_use]
    pub fn stream(
        &self,
        input: impl Into<GraphInput>,
        config: RuntimeConfig,
        modes: Vec<StreamMode>,
    ) -> (
        EventStream,
        tokio::task::JoinHandle<Result<GraphOutput, LoopError>>,
    ) {
        let mut config = config;
        // The loop only emits what someone asked for.
        for mode in &modes {
            if !config.stream_modes.contains(mode) {
                config.stream_modes.push(*mode);
            }
        }
        let runner = AppRunner::new(Arc::new(self.clone()), config);
        let stream = runner.stream_hub().subscribe(None, modes);
        let input = input.into();
        let handle = tokio::spawn(async move { runner.run(input).await });
        (stream, handle)
    }

    /// Run several inputs concurrently, each as its own invocation.
    pub async fn batch(
        &self,
        inputs: Vec<Value>,
        config: RuntimeConfig,
    ) -> Vec<Result<GraphOutput, LoopError>> {
        let futures = inputs.into_iter().map(|input| {
            let config = RuntimeConfig {
                thread_id: config.thread_id.as_ref().map(|t| {
                    // Distinct sub-threads keep batched inputs isolated.
                    format!("{t}:{}", Uuid::new_v4())
                }),
                ..config.clone()
            };
            self.invoke(input, config)
        });
        join_all(futures).await
    }

    /// The state of the thread addressed by `config`.
    pub async fn get_state(
        &self,
        config: &RuntimeConfig,
    ) -> Result<Option<StateView>, LoopError> {
        let Some(saver) = &self.saver else {
            return Ok(None);
        };
        let thread_id = config.resolved_thread_id();
        let Some(tuple) = saver.get_tuple(&config.checkpoint_config(&thread_id)).await? else {
            return Ok(None);
        };
        Ok(Some(self.view_of(&tuple, &config.checkpoint_ns)?))
    }

    /// Checkpoint history, newest first.
    pub async fn get_state_history(
        &self,
        config: &RuntimeConfig,
        options: ListOptions,
    ) -> Result<Vec<StateView>, LoopError> {
        let Some(saver) = &self.saver else {
            return Ok(Vec::new());
        };
        let thread_id = config.resolved_thread_id();
        let tuples = saver
            .list(&config.checkpoint_config(&thread_id).latest(), &options)
            .await?;
        tuples
            .iter()
            .map(|t| self.view_of(t, &config.checkpoint_ns))
            .collect()
    }

    fn view_of(
        &self,
        tuple: &CheckpointTuple,
        checkpoint_ns: &str,
    ) -> Result<StateView, LoopError> {
        let mut channels = self.base_channels();
        for (name, snapshot) in &tuple.checkpoint.channel_values {
            if let Some(proto) = channels.get(name) {
                let restored = proto.restore(name, snapshot.clone())?;
                channels.insert(name.clone(), restored);
            }
        }
        let next_tasks = prepare_next_tasks(&PrepareContext {
            checkpoint: &tuple.checkpoint,
            pending_writes: &tuple.pending_writes,
            nodes: &self.nodes,
            channels: &channels,
            checkpoint_ns,
            step: tuple.metadata.step + 1,
            for_execution: false,
            updated_channels: None,
            trigger_to_nodes: Some(&self.trigger_to_nodes),
        });

        let mut tasks: FxHashMap<Uuid, TaskView> = FxHashMap::default();
        for write in &tuple.pending_writes {
            let entry = tasks.entry(write.task_id).or_insert_with(|| TaskView {
                id: write.task_id,
                ..TaskView::default()
            });
            match write.channel.as_str() {
                INTERRUPT => entry.interrupts.push(write.value.clone()),
                ERROR => entry.error = Some(write.value.to_string()),
                _ => {}
            }
        }

        Ok(StateView {
            values: self.schema.read_values(&channels),
            next: next_tasks.into_iter().map(|t| t.name).collect(),
            config: tuple.config.clone(),
            metadata: tuple.metadata.clone(),
            created_at: tuple.checkpoint.ts,
            parent_config: tuple.parent_config.clone(),
            tasks: tasks.into_values().collect(),
        })
    }

    /// Write `values` as if `as_node` produced them, creating a new
    /// checkpoint. Returns the config addressing it.
    #[instrument(skip(self, config, values), err)]
    pub async fn update_state(
        &self,
        config: &RuntimeConfig,
        values: Vec<(String, Value)>,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig, LoopError> {
        let Some(saver) = &self.saver else {
            return Err(LoopError::Saver(crate::checkpoint::SaverError::Other {
                message: "update_state requires a checkpoint saver".to_string(),
            }));
        };
        let thread_id = config.resolved_thread_id();
        let base = config.checkpoint_config(&thread_id);
        let loaded = saver.get_tuple(&base).await?;
        let (mut checkpoint, step, head) = match loaded {
            Some(tuple) => (
                tuple.checkpoint,
                tuple.metadata.step + 1,
                tuple.config,
            ),
            None => (Checkpoint::empty(), -1, base),
        };
        let mut channels = self.base_channels();
        for (name, snapshot) in &checkpoint.channel_values {
            if let Some(proto) = channels.get(name) {
                let restored = proto.restore(name, snapshot.clone())?;
                channels.insert(name.clone(), restored);
            }
        }

        let node_name = as_node.unwrap_or(START);
        // Writers of the impersonated node run too, so routing stays
        // consistent with a real execution of that node.
        let mut writes = values;
        if let Some(spec) = self.nodes.get(node_name) {
            for writer in &spec.writers {
                match writer {
                    EdgeWriter::To(target) => writes.push((
                        crate::graphs::edges::trigger_channel(target),
                        Value::Null,
                    )),
                    EdgeWriter::Join { channel } => {
                        writes.push((channel.clone(), serde_json::json!(node_name)));
                    }
                    EdgeWriter::Branch(edge) => {
                        let fresh = crate::algo::local_read(
                            &channels,
                            &self.state_fields,
                            &writes,
                            true,
                        )?;
                        let state = Value::Object(fresh.into_iter().collect());
                        for goto in (edge.predicate)(&state) {
                            if let crate::control::Goto::Node(target) = &goto {
                                if target != crate::types::END {
                                    writes.push((
                                        crate::graphs::edges::trigger_channel(target),
                                        Value::Null,
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        let synthetic = CommittedTask {
            name: node_name.to_string(),
            path: (String::new(), String::new(), node_name.to_string()),
            triggers: Vec::new(),
            writes,
        };
        apply_writes(
            &mut checkpoint,
            &mut channels,
            std::slice::from_ref(&synthetic),
            &self.next_version,
            &self.trigger_to_nodes,
        )?;

        let new_checkpoint = Checkpoint::capture(
            &channels,
            checkpoint.channel_versions.clone(),
            checkpoint.versions_seen.clone(),
            checkpoint.pending_sends.clone(),
        );
        let stored = saver
            .put(
                &head,
                new_checkpoint,
                CheckpointMetadata::new(CheckpointSource::Update, step),
                FxHashMap::default(),
            )
            .await?;
        Ok(stored)
    }

    /// Apply several supersteps of writes in order; each superstep is a
    /// list of `(as_node, writes)` entries.
    pub async fn bulk_update_state(
        &self,
        config: &RuntimeConfig,
        supersteps: Vec<Vec<(Option<String>, Vec<(String, Value)>)>>,
    ) -> Result<CheckpointConfig, LoopError> {
        let mut latest = config.checkpoint_config(&config.resolved_thread_id());
        let mut config = config.clone();
        for superstep in supersteps {
            for (as_node, writes) in superstep {
                latest = self
                    .update_state(&config, writes, as_node.as_deref())
                    .await?;
                config.checkpoint_id = latest.checkpoint_id;
            }
        }
        Ok(latest)
    }

    /// Wrap this app as a node of an enclosing graph.
    ///
    /// The child inherits the parent's thread and appends the node name to
    /// its checkpoint namespace. Interrupts bubble to the parent; a
    /// `Command{graph: Parent}` raised inside is caught at this boundary
    /// and re-applied one level up.
    #[must_use]
    pub fn into_node(self) -> SubgraphNode {
        SubgraphNode {
            app: Arc::new(self),
        }
    }
}

/// An [`App`] embedded as a node of an enclosing graph.
pub struct SubgraphNode {
    app: Arc<App>,
}

#[async_trait]
impl Node for SubgraphNode {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let ns = if ctx.checkpoint_ns.is_empty() {
            ctx.node.clone()
        } else {
            format!("{}{NS_SEP}{}", ctx.checkpoint_ns, ctx.node)
        };
        let config = RuntimeConfig::new()
            .with_thread_id(ctx.thread_id.clone())
            .with_checkpoint_ns(ns.clone());

        // Resume the child when it is suspended mid-graph; otherwise start
        // it fresh with the parent's input.
        let child_input = match &self.app.saver {
            Some(saver) => {
                let tuple = saver
                    .get_tuple(&config.checkpoint_config(&ctx.thread_id))
                    .await
                    .map_err(|e| NodeError::Other(e.to_string()))?;
                let suspended = tuple.as_ref().is_some_and(|t| {
                    t.pending_writes.iter().any(|w| w.channel == INTERRUPT)
                });
                if suspended {
                    match ctx.take_resume() {
                        Some(answer) => GraphInput::Command(Command::resume(answer)),
                        None => GraphInput::Resume,
                    }
                } else {
                    GraphInput::Start(input)
                }
            }
            None => GraphInput::Start(input),
        };

        let runner = AppRunner::new(Arc::clone(&self.app), config);
        match runner.run(child_input).await {
            Ok(GraphOutput::Complete(values)) => {
                Ok(NodeOutput::updates(values.into_iter().collect()))
            }
            Ok(GraphOutput::Interrupted(interrupts)) => Err(NodeError::Interrupt(interrupts)),
            Err(LoopError::ParentCommand(command)) => {
                let mut command = *command;
                command.graph = crate::control::CommandGraph::Current;
                Ok(NodeOutput::Command(command))
            }
            Err(err) => Err(NodeError::Other(err.to_string())),
        }
    }
}
