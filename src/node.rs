//! Node execution framework.
//!
//! A node is the declarative unit of computation: it subscribes to a set of
//! channels, is fired by its triggers, runs an async computation, and
//! declares its writers. This module provides the [`Node`] trait, the
//! [`NodeSpec`] record the engine schedules from, the execution context
//! passed into every run, and node-level error handling.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::control::{Command, Interrupt};
use crate::graphs::edges::EdgeWriter;
use crate::runtimes::retry::RetryPolicy;
use crate::store::Store;
use crate::stream::{StreamPayload, StreamSender};

/// Tag that hides a node from `interrupt_before/after = "*"` matching.
pub const TAG_HIDDEN: &str = "hidden";

// ============================================================================
// Core trait
// ============================================================================

/// An executable unit of work.
///
/// Nodes receive their assembled input (per the spec's channel-read rule)
/// and the execution context, perform their work, and return either channel
/// updates or a [`Command`]. Nodes should be stateless; anything that must
/// survive a step belongs in a channel.
///
/// # Examples
///
/// ```rust,no_run
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
///
/// struct Increment;
///
/// #[async_trait]
/// impl Node for Increment {
///     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
///         let n = input["input"].as_i64().ok_or(NodeError::MissingInput { what: "input" })?;
///         Ok(NodeOutput::write("output", json!(n + 1)))
///     }
/// }
/// ```
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Blanket adapter so plain async closures can serve as nodes in tests and
/// small graphs.
pub struct FnNode<F>(pub F);

#[async_trait]
impl<F, Fut> Node for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        (self.0)(input, ctx).await
    }
}

// ============================================================================
// Output
// ============================================================================

/// What a node produced.
#[derive(Clone, Debug)]
pub enum NodeOutput {
    /// Plain channel writes, applied at the superstep barrier.
    Updates(Vec<(String, Value)>),
    /// A combined state patch and routing decision.
    Command(Command),
}

impl NodeOutput {
    /// No writes; the runner records a `NO_WRITES` sentinel so the task is
    /// not re-selected.
    #[must_use]
    pub fn empty() -> Self {
        NodeOutput::Updates(Vec::new())
    }

    /// A single channel write.
    #[must_use]
    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeOutput::Updates(vec![(channel.into(), value)])
    }

    /// Multiple channel writes.
    #[must_use]
    pub fn updates(writes: Vec<(String, Value)>) -> Self {
        NodeOutput::Updates(writes)
    }

    /// A return value for a dynamically called task: delivered to the
    /// caller of [`NodeContext::call`] through the reserved return channel.
    #[must_use]
    pub fn return_value(value: Value) -> Self {
        NodeOutput::Updates(vec![(crate::types::RETURN.to_string(), value)])
    }

    /// Append another write.
    #[must_use]
    pub fn and_write(self, channel: impl Into<String>, value: Value) -> Self {
        match self {
            NodeOutput::Updates(mut writes) => {
                writes.push((channel.into(), value));
                NodeOutput::Updates(writes)
            }
            NodeOutput::Command(cmd) => NodeOutput::Command(cmd.with_update(channel, value)),
        }
    }
}

impl From<Command> for NodeOutput {
    fn from(cmd: Command) -> Self {
        NodeOutput::Command(cmd)
    }
}

// ============================================================================
// Spec
// ============================================================================

/// How a node's input is assembled from channels.
#[derive(Clone, Debug)]
pub enum ChannelRead {
    /// Linear probe: the first available channel's bare value.
    First(Vec<String>),
    /// Object with one key per alias; unavailable channels are omitted.
    Object(Vec<(String, String)>),
}

/// Maps the assembled raw input into the node's input shape.
pub type InputMapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Declarative description of a node as the engine schedules it.
#[derive(Clone)]
pub struct NodeSpec {
    pub name: String,
    /// Channels the node reads its input from.
    pub channels: ChannelRead,
    /// Channels whose version advance makes this node a candidate.
    pub triggers: Vec<String>,
    /// Applied to the assembled input last.
    pub mapper: Option<InputMapper>,
    /// Static and conditional edges attached to this node.
    pub writers: Vec<EdgeWriter>,
    pub retry_policy: Option<RetryPolicy>,
    pub tags: Vec<String>,
    pub metadata: FxHashMap<String, Value>,
    /// The computation itself.
    pub node: Arc<dyn Node>,
}

impl NodeSpec {
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.tags.iter().any(|t| t == TAG_HIDDEN)
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("triggers", &self.triggers)
            .field("writers", &self.writers.len())
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Execution context
// ============================================================================

/// Hook the runner injects so nodes can schedule dynamic child tasks and
/// await their results within the current superstep.
#[async_trait]
pub trait DynamicCall: Send + Sync {
    async fn call(&self, node: &str, input: Value) -> Result<Value, NodeError>;
}

/// Resume values and interrupt bookkeeping for one task execution.
///
/// Cloned into retries so interrupt indices stay stable across attempts.
#[derive(Clone, Debug, Default)]
pub struct InterruptScratchpad {
    resume: Arc<Vec<Value>>,
    counter: Arc<AtomicUsize>,
}

impl InterruptScratchpad {
    #[must_use]
    pub fn with_resume(resume: Vec<Value>) -> Self {
        Self {
            resume: Arc::new(resume),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reset the consumption counter (fresh attempt of the same task).
    pub fn rewind(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }

    fn take_next(&self) -> (usize, Option<Value>) {
        let idx = self.counter.fetch_add(1, Ordering::SeqCst);
        (idx, self.resume.get(idx).cloned())
    }

    /// Consume the next resume value only if one is present.
    pub(crate) fn try_take(&self) -> Option<Value> {
        let idx = self.counter.load(Ordering::SeqCst);
        if idx < self.resume.len() {
            self.counter.store(idx + 1, Ordering::SeqCst);
            self.resume.get(idx).cloned()
        } else {
            None
        }
    }

    /// Values consumed so far this attempt.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.counter.load(Ordering::SeqCst).min(self.resume.len())
    }
}

/// Execution context passed to nodes.
#[derive(Clone)]
pub struct NodeContext {
    /// Name of the executing node.
    pub node: String,
    /// Superstep number.
    pub step: i64,
    /// Stable task identity (survives retries).
    pub task_id: Uuid,
    /// Thread the invocation runs under.
    pub thread_id: String,
    /// Namespace path of the executing (sub)graph.
    pub checkpoint_ns: String,
    pub(crate) emitter: Option<StreamSender>,
    pub(crate) scratchpad: InterruptScratchpad,
    pub(crate) caller: Option<Arc<dyn DynamicCall>>,
    pub(crate) store: Option<Arc<dyn Store>>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("step", &self.step)
            .field("task_id", &self.task_id)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Suspend cooperatively, exposing `value` to the caller.
    ///
    /// If a matching resume value was supplied (by a previous invocation
    /// answering this interrupt), it is returned immediately and execution
    /// continues. Otherwise the engine persists the interrupt and yields
    /// control to the caller.
    pub fn interrupt(&self, value: Value) -> Result<Value, NodeError> {
        let (idx, resume) = self.scratchpad.take_next();
        match resume {
            Some(answer) => Ok(answer),
            None => Err(NodeError::Interrupt(vec![Interrupt::new(
                value,
                self.task_id,
                idx,
            )])),
        }
    }

    /// Consume the next pending resume value without raising an interrupt.
    /// Used by subgraph boundaries to forward answers into the child.
    #[must_use]
    pub fn take_resume(&self) -> Option<Value> {
        self.scratchpad.try_take()
    }

    /// Emit a `custom`-mode stream payload.
    pub fn write_custom(&self, payload: Value) {
        if let Some(emitter) = &self.emitter {
            let _ = emitter.emit(StreamPayload::Custom {
                node: self.node.clone(),
                payload,
            });
        }
    }

    /// Emit a `messages`-mode stream payload.
    pub fn emit_message(&self, message: Value) {
        if let Some(emitter) = &self.emitter {
            let _ = emitter.emit(StreamPayload::Messages {
                node: self.node.clone(),
                message,
            });
        }
    }

    /// Schedule a dynamic child task and await its return value.
    ///
    /// The child runs under the same superstep's concurrency budget and is
    /// deduplicated by task id, so a crashed step re-running the parent
    /// reuses the child's recorded result instead of re-executing it.
    pub async fn call(&self, node: &str, input: Value) -> Result<Value, NodeError> {
        match &self.caller {
            Some(caller) => caller.call(node, input).await,
            None => Err(NodeError::Unsupported {
                what: "dynamic call outside a running superstep",
            }),
        }
    }

    /// The ancillary key/value store, when one is attached to the app.
    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }

    /// Build a detached context for unit-testing nodes.
    #[must_use]
    pub fn for_test(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            step: 0,
            task_id: Uuid::new_v4(),
            thread_id: "test".to_string(),
            checkpoint_ns: String::new(),
            emitter: None,
            scratchpad: InterruptScratchpad::default(),
            caller: None,
            store: None,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by node execution.
///
/// `Interrupt` and `ParentCommand` are control-flow bubbles, not failures:
/// the runner intercepts them before the error policy applies. Everything
/// else is retried per the task's policy and, on exhaustion, recorded as an
/// `ERROR` write and surfaced to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data is missing from the assembled input.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stepgraph::node::missing_input),
        help("Check that an upstream node produced the required data: {what}.")
    )]
    MissingInput { what: &'static str },

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(
        code(stepgraph::node::validation),
        help("Check input data format and required fields.")
    )]
    ValidationFailed(String),

    /// External provider or service error.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stepgraph::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    #[diagnostic(code(stepgraph::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// The operation is not available in this execution mode.
    #[error("unsupported operation: {what}")]
    #[diagnostic(code(stepgraph::node::unsupported))]
    Unsupported { what: &'static str },

    /// Cooperative suspension; carries the interrupts raised by this task.
    #[error("graph interrupted")]
    #[diagnostic(code(stepgraph::node::interrupt))]
    Interrupt(Vec<Interrupt>),

    /// A command addressed to the enclosing graph; bubbles out of the
    /// current subgraph loop.
    #[error("command addressed to parent graph")]
    #[diagnostic(code(stepgraph::node::parent_command))]
    ParentCommand(Box<Command>),

    /// The task observed an abort signal and stopped cooperatively.
    #[error("task cancelled")]
    #[diagnostic(code(stepgraph::node::cancelled))]
    Cancelled,

    /// Any other node failure.
    #[error("{0}")]
    #[diagnostic(code(stepgraph::node::other))]
    Other(String),
}

impl NodeError {
    /// `true` for the control-flow bubbles that must never be retried or
    /// recorded as errors.
    #[must_use]
    pub fn is_bubble(&self) -> bool {
        matches!(
            self,
            NodeError::Interrupt(_) | NodeError::ParentCommand(_) | NodeError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interrupt_without_resume_bubbles() {
        let ctx = NodeContext::for_test("n");
        let err = ctx.interrupt(json!("question")).unwrap_err();
        match err {
            NodeError::Interrupt(interrupts) => {
                assert_eq!(interrupts.len(), 1);
                assert_eq!(interrupts[0].value, json!("question"));
                assert_eq!(interrupts[0].index, 0);
            }
            other => panic!("expected interrupt, got {other:?}"),
        }
    }

    #[test]
    fn interrupt_with_resume_returns_answer() {
        let mut ctx = NodeContext::for_test("n");
        ctx.scratchpad = InterruptScratchpad::with_resume(vec![json!(42)]);
        assert_eq!(ctx.interrupt(json!("q")).unwrap(), json!(42));
        // second interrupt in the same run has no answer yet
        assert!(ctx.interrupt(json!("q2")).is_err());
    }

    #[test]
    fn scratchpad_rewind_resets_consumption() {
        let pad = InterruptScratchpad::with_resume(vec![json!(1)]);
        let (idx, v) = pad.take_next();
        assert_eq!((idx, v), (0, Some(json!(1))));
        pad.rewind();
        let (idx, v) = pad.take_next();
        assert_eq!((idx, v), (0, Some(json!(1))));
    }

    #[test]
    fn output_builder_appends() {
        let out = NodeOutput::write("a", json!(1)).and_write("b", json!(2));
        match out {
            NodeOutput::Updates(writes) => assert_eq!(writes.len(), 2),
            NodeOutput::Command(_) => panic!("expected updates"),
        }
    }

    #[tokio::test]
    async fn fn_node_adapts_plain_async_fns() {
        async fn double(input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::write(
                "out",
                json!(input.as_i64().unwrap_or(0) * 2),
            ))
        }
        let node = FnNode(double);
        let out = node.run(json!(4), NodeContext::for_test("d")).await.unwrap();
        match out {
            NodeOutput::Updates(writes) => assert_eq!(writes[0].1, json!(8)),
            NodeOutput::Command(_) => panic!("expected updates"),
        }
    }
}
