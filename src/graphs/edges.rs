//! Edge writers: static topology and conditional routing.
//!
//! Edges are attached to their source node as writers. When the node's task
//! commits, static edges write the trigger slot of their target and
//! conditional edges evaluate a predicate against the node's fresh state
//! (its own writes applied) to decide the targets — including dynamic
//! [`SendPacket`](crate::control::SendPacket) dispatch.

use serde_json::Value;
use std::sync::Arc;

use crate::control::Goto;

/// Prefix of the per-node trigger channel.
pub const BRANCH_PREFIX: &str = "branch:to:";

/// Name of the trigger channel for `node`.
#[must_use]
pub fn trigger_channel(node: &str) -> String {
    format!("{BRANCH_PREFIX}{node}")
}

/// Name of the barrier channel joining `sources` into `target`.
#[must_use]
pub fn join_channel(sources: &[String], target: &str) -> String {
    format!("join:{}:{target}", sources.join("+"))
}

/// Routing predicate: observes the writer's fresh state and names the
/// targets to fire next.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use stepgraph::control::Goto;
/// use stepgraph::graphs::edges::EdgePredicate;
///
/// let route: EdgePredicate = Arc::new(|state| {
///     if state["score"].as_f64().unwrap_or(0.0) > 0.5 {
///         vec![Goto::from("accept")]
///     } else {
///         vec![Goto::from("retry")]
///     }
/// });
/// ```
pub type EdgePredicate = Arc<dyn Fn(&Value) -> Vec<Goto> + Send + Sync>;

/// A conditional edge attached to its source node.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub source: String,
    pub predicate: EdgePredicate,
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// A writer a node carries besides its own channel updates.
#[derive(Clone, Debug)]
pub enum EdgeWriter {
    /// Unconditional edge: fire the target's trigger slot.
    To(String),
    /// Fan-in edge: contribute this node's name to a barrier channel.
    Join { channel: String },
    /// Conditional edge evaluated over the node's fresh state.
    Branch(ConditionalEdge),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_stable() {
        assert_eq!(trigger_channel("worker"), "branch:to:worker");
        assert_eq!(
            join_channel(&["a".to_string(), "b".to_string()], "c"),
            "join:a+b:c"
        );
    }
}
