//! Control-flow values emitted by nodes to influence scheduling.
//!
//! Routing intent is kept separate from state updates so nodes can express
//! "where next" without mutating application state directly. The commit
//! phase folds these directives into channel writes in a deterministic
//! order, and the loop reconciles them with static and conditional edges.
//!
//! Three primitives:
//!
//! - [`SendPacket`] — dynamic fan-out: queue a task for a named node with
//!   explicit arguments, bypassing the subscription mechanism;
//! - [`Command`] — combined state patch + routing decision, optionally
//!   addressed to the parent graph;
//! - [`Interrupt`] — cooperative suspension carrying a payload to the
//!   caller, answered by a later `Command::resume`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::END;

/// A dynamically scheduled task: run `node` with `args` in the next
/// superstep (or within the current one when emitted by a running task).
///
/// Packets queue on the reserved `TASKS` channel and persist across crashes
/// as part of the checkpoint, preserving FIFO order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendPacket {
    pub node: String,
    pub args: Value,
}

impl SendPacket {
    pub fn new(node: impl Into<String>, args: Value) -> Self {
        Self {
            node: node.into(),
            args,
        }
    }
}

/// A routing target produced by a node or a conditional edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Goto {
    /// Route to a named node (the virtual `__end__` terminates the branch).
    Node(String),
    /// Dynamic dispatch with explicit arguments.
    Send(SendPacket),
}

impl Goto {
    /// Returns `true` when this target terminates the branch.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Goto::Node(n) if n == END)
    }
}

impl From<&str> for Goto {
    fn from(s: &str) -> Self {
        Goto::Node(s.to_string())
    }
}

impl From<String> for Goto {
    fn from(s: String) -> Self {
        Goto::Node(s)
    }
}

impl From<SendPacket> for Goto {
    fn from(p: SendPacket) -> Self {
        Goto::Send(p)
    }
}

/// Which graph a [`Command`] addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommandGraph {
    /// The graph the emitting node belongs to.
    #[default]
    Current,
    /// The enclosing graph; the effect bubbles out one namespace level.
    Parent,
}

/// A node's combined state patch and routing decision.
///
/// Returning a command is equivalent to emitting `update` as normal writes
/// while simultaneously writing each `goto` to the routing layer. `resume`
/// answers a pending [`Interrupt`] on the addressed thread.
#[derive(Clone, Debug, Default)]
pub struct Command {
    pub graph: CommandGraph,
    pub goto: Vec<Goto>,
    pub update: Vec<(String, Value)>,
    pub resume: Option<ResumeValue>,
}

impl Command {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route to one target.
    #[must_use]
    pub fn goto(target: impl Into<Goto>) -> Self {
        Self {
            goto: vec![target.into()],
            ..Self::default()
        }
    }

    /// Answer the pending interrupt(s) with a single value.
    #[must_use]
    pub fn resume(value: Value) -> Self {
        Self {
            resume: Some(ResumeValue::Single(value)),
            ..Self::default()
        }
    }

    /// Answer specific interrupted tasks by id.
    #[must_use]
    pub fn resume_map(map: Vec<(Uuid, Value)>) -> Self {
        Self {
            resume: Some(ResumeValue::ByTask(map)),
            ..Self::default()
        }
    }

    /// Add a state patch entry.
    #[must_use]
    pub fn with_update(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.update.push((channel.into(), value));
        self
    }

    /// Append another routing target.
    #[must_use]
    pub fn with_goto(mut self, target: impl Into<Goto>) -> Self {
        self.goto.push(target.into());
        self
    }

    /// Address the enclosing graph instead of the current one.
    #[must_use]
    pub fn with_parent_graph(mut self) -> Self {
        self.graph = CommandGraph::Parent;
        self
    }
}

/// How a resume input maps onto interrupted tasks.
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeValue {
    /// Delivered to the first (and typically only) interrupted task.
    Single(Value),
    /// Targeted delivery keyed by task id.
    ByTask(Vec<(Uuid, Value)>),
}

/// Payload of a cooperative suspension.
///
/// Stored as an `INTERRUPT` pending write on the current checkpoint and
/// surfaced to the caller; a subsequent invocation with a matching resume
/// value re-enters the interrupting call and delivers the answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// The value the node exposed to the caller.
    pub value: Value,
    /// Id of the task that raised the interrupt.
    pub task_id: Uuid,
    /// Zero-based index among interrupts raised by the same task.
    pub index: usize,
}

impl Interrupt {
    pub fn new(value: Value, task_id: Uuid, index: usize) -> Self {
        Self {
            value,
            task_id,
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_packet_roundtrips_through_json() {
        let p = SendPacket::new("worker", json!({"shard": 3}));
        let v = serde_json::to_value(&p).unwrap();
        let back: SendPacket = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn goto_end_detection() {
        assert!(Goto::from(crate::types::END).is_end());
        assert!(!Goto::from("worker").is_end());
        assert!(!Goto::Send(SendPacket::new("worker", Value::Null)).is_end());
    }

    #[test]
    fn command_builder_accumulates() {
        let cmd = Command::goto("a")
            .with_goto(SendPacket::new("b", json!(1)))
            .with_update("counter", json!(2))
            .with_parent_graph();
        assert_eq!(cmd.goto.len(), 2);
        assert_eq!(cmd.update.len(), 1);
        assert_eq!(cmd.graph, CommandGraph::Parent);
    }
}
