//! Fluent construction of workflow graphs.
//!
//! `GraphBuilder` is the thin user-facing layer over the core's node and
//! channel registration: it collects the state schema, nodes, edges, and
//! interrupt configuration, and [`compile`](GraphBuilder::compile)s them
//! into an executable [`App`](crate::app::App).

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::algo::InterruptNodes;
use crate::checkpoint::CheckpointSaver;
use crate::node::{InputMapper, Node};
use crate::runtimes::retry::RetryPolicy;
use crate::store::Store;
use crate::types::{ChannelVersion, NextVersion};

use super::edges::{ConditionalEdge, EdgePredicate};
use super::schema::StateSchema;

/// Per-node configuration beyond the computation itself.
#[derive(Clone, Default)]
pub struct NodeOptions {
    pub retry_policy: Option<RetryPolicy>,
    pub tags: Vec<String>,
    pub metadata: FxHashMap<String, Value>,
    /// Applied to the assembled raw input last, before the node runs.
    pub mapper: Option<InputMapper>,
}

impl NodeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_input_mapper(mut self, mapper: InputMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }
}

pub(super) struct NodeEntry {
    pub node: Arc<dyn Node>,
    pub options: NodeOptions,
}

/// Sources of an edge: one node or a fan-in set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum EdgeSource {
    Single(String),
    Many(Vec<String>),
}

/// Builder for workflow graphs.
///
/// Every graph needs a state schema, at least one node, and an entry edge
/// from the virtual start node.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use stepgraph::channels::Channel;
/// use stepgraph::graphs::{GraphBuilder, StateSchema};
/// use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
///
/// struct Increment;
///
/// #[async_trait]
/// impl Node for Increment {
///     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
///         let n = input["input"].as_i64().unwrap_or_default();
///         Ok(NodeOutput::write("output", json!(n + 1)))
///     }
/// }
///
/// let app = GraphBuilder::new(
///     StateSchema::new()
///         .field("input", Channel::last_value())
///         .field("output", Channel::last_value()),
/// )
/// .add_node("one", Increment)
/// .set_entry("one")
/// .add_terminal_edge("one")
/// .compile()
/// .unwrap();
/// ```
pub struct GraphBuilder {
    pub(super) schema: StateSchema,
    pub(super) nodes: FxHashMap<String, NodeEntry>,
    /// Insertion order of node names, for deterministic channel layout.
    pub(super) node_order: Vec<String>,
    pub(super) edges: Vec<(EdgeSource, String)>,
    pub(super) conditional_edges: Vec<ConditionalEdge>,
    pub(super) interrupt_before: InterruptNodes,
    pub(super) interrupt_after: InterruptNodes,
    pub(super) saver: Option<Arc<dyn CheckpointSaver>>,
    pub(super) store: Option<Arc<dyn Store>>,
    pub(super) next_version: NextVersion,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            nodes: FxHashMap::default(),
            node_order: Vec::new(),
            edges: Vec::new(),
            conditional_edges: Vec::new(),
            interrupt_before: InterruptNodes::Never,
            interrupt_after: InterruptNodes::Never,
            saver: None,
            store: None,
            next_version: Arc::new(|max| ChannelVersion::next(max)),
        }
    }

    /// Register a node under `name` with default options.
    #[must_use]
    pub fn add_node(self, name: impl Into<String>, node: impl Node + 'static) -> Self {
        self.add_node_with(name, node, NodeOptions::default())
    }

    /// Register a node with explicit options.
    #[must_use]
    pub fn add_node_with(
        mut self,
        name: impl Into<String>,
        node: impl Node + 'static,
        options: NodeOptions,
    ) -> Self {
        let name = name.into();
        if !self.nodes.contains_key(&name) {
            self.node_order.push(name.clone());
        }
        self.nodes.insert(
            name,
            NodeEntry {
                node: Arc::new(node),
                options,
            },
        );
        self
    }

    /// Unconditional edge `from -> to`. `to` may be the virtual end node.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges
            .push((EdgeSource::Single(from.into()), to.into()));
        self
    }

    /// Fan-in edge: `to` fires only after every source has completed.
    #[must_use]
    pub fn add_edge_from_all(
        mut self,
        sources: impl IntoIterator<Item = String>,
        to: impl Into<String>,
    ) -> Self {
        let mut sources: Vec<String> = sources.into_iter().collect();
        sources.sort();
        self.edges.push((EdgeSource::Many(sources), to.into()));
        self
    }

    /// Entry edge from the virtual start node.
    #[must_use]
    pub fn set_entry(self, node: impl Into<String>) -> Self {
        let node = node.into();
        self.add_edge(crate::types::START, node)
    }

    /// Terminal edge to the virtual end node.
    #[must_use]
    pub fn add_terminal_edge(self, node: impl Into<String>) -> Self {
        self.add_edge(node, crate::types::END)
    }

    /// Conditional edge: after `from` commits, `predicate` observes its
    /// fresh state and routes.
    #[must_use]
    pub fn add_conditional_edge(
        mut self,
        from: impl Into<String>,
        predicate: EdgePredicate,
    ) -> Self {
        self.conditional_edges.push(ConditionalEdge {
            source: from.into(),
            predicate,
        });
        self
    }

    /// Suspend before any of these nodes would run (`*` = all).
    #[must_use]
    pub fn interrupt_before(mut self, nodes: InterruptNodes) -> Self {
        self.interrupt_before = nodes;
        self
    }

    /// Suspend after any of these nodes has run (`*` = all).
    #[must_use]
    pub fn interrupt_after(mut self, nodes: InterruptNodes) -> Self {
        self.interrupt_after = nodes;
        self
    }

    /// Attach a checkpoint saver; without one, execution is ephemeral.
    #[must_use]
    pub fn with_saver(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    /// Attach the ancillary key/value store exposed to nodes.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the channel version generator.
    #[must_use]
    pub fn with_next_version(mut self, next_version: NextVersion) -> Self {
        self.next_version = next_version;
        self
    }
}
