//! Graph validation and compilation into an executable app.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::app::App;
use crate::channels::Channel;
use crate::node::{ChannelRead, NodeSpec};
use crate::types::{is_reserved, END, NS_SEP, START};

use super::builder::{EdgeSource, GraphBuilder};
use super::edges::{join_channel, trigger_channel, EdgeWriter};

/// Errors raised while validating or compiling a graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphCompileError {
    #[error("channel name `{name}` is reserved or invalid")]
    #[diagnostic(
        code(stepgraph::graphs::reserved_channel),
        help("Pick a name outside the engine's reserved set, without the namespace separator.")
    )]
    ReservedChannelName { name: String },

    #[error("node name `{name}` is reserved or invalid")]
    #[diagnostic(
        code(stepgraph::graphs::reserved_node),
        help("Node names may not be empty, reserved, or contain the namespace separator.")
    )]
    ReservedNodeName { name: String },

    #[error("edge references unknown node `{name}`")]
    #[diagnostic(
        code(stepgraph::graphs::unknown_node),
        help("Register the node with add_node before wiring edges to it.")
    )]
    UnknownNode { name: String },

    #[error("graph has no entry edge from the start node")]
    #[diagnostic(
        code(stepgraph::graphs::no_entry),
        help("Call set_entry (or add an edge from the virtual start node).")
    )]
    NoEntryPoint,

    #[error("input references unknown state field `{name}`")]
    #[diagnostic(code(stepgraph::graphs::unknown_input_field))]
    UnknownInputField { name: String },

    #[error("state schema declares no fields")]
    #[diagnostic(code(stepgraph::graphs::empty_schema))]
    EmptySchema,
}

impl GraphBuilder {
    /// Validate and compile into an executable [`App`].
    pub fn compile(self) -> Result<App, GraphCompileError> {
        self.schema.validate()?;
        if self.schema.is_empty() {
            return Err(GraphCompileError::EmptySchema);
        }

        for name in self.nodes.keys() {
            if name.is_empty() || is_reserved(name) || name.contains(NS_SEP) {
                return Err(GraphCompileError::ReservedNodeName { name: name.clone() });
            }
            if self.schema.contains(name) {
                // A node and a state field sharing a name would collide on
                // the versions_seen keyspace.
                return Err(GraphCompileError::ReservedNodeName { name: name.clone() });
            }
        }

        let known = |name: &str| name == START || name == END || self.nodes.contains_key(name);
        for (source, target) in &self.edges {
            match source {
                EdgeSource::Single(s) if !known(s) => {
                    return Err(GraphCompileError::UnknownNode { name: s.clone() })
                }
                EdgeSource::Many(sources) => {
                    if let Some(bad) = sources.iter().find(|s| !self.nodes.contains_key(*s)) {
                        return Err(GraphCompileError::UnknownNode { name: bad.clone() });
                    }
                }
                EdgeSource::Single(_) => {}
            }
            if !known(target) {
                return Err(GraphCompileError::UnknownNode {
                    name: target.clone(),
                });
            }
        }
        for edge in &self.conditional_edges {
            if !self.nodes.contains_key(&edge.source) && edge.source != START {
                return Err(GraphCompileError::UnknownNode {
                    name: edge.source.clone(),
                });
            }
        }

        let entries: Vec<String> = self
            .edges
            .iter()
            .filter(|(source, _)| matches!(source, EdgeSource::Single(s) if s == START))
            .map(|(_, target)| target.clone())
            .filter(|t| t != END)
            .collect();
        let has_start_branch = self.conditional_edges.iter().any(|e| e.source == START);
        if entries.is_empty() && !has_start_branch {
            return Err(GraphCompileError::NoEntryPoint);
        }

        // Channel layout: state fields, one trigger slot per node, one
        // barrier per fan-in edge.
        let mut channels = self.schema.instantiate();
        for name in &self.node_order {
            channels.insert(trigger_channel(name), Channel::ephemeral_unguarded());
        }

        let mut writers: FxHashMap<String, Vec<EdgeWriter>> = FxHashMap::default();
        let mut start_writers: Vec<EdgeWriter> = Vec::new();
        for (source, target) in &self.edges {
            match source {
                EdgeSource::Single(s) if s == START => {
                    if target != END {
                        start_writers.push(EdgeWriter::To(target.clone()));
                    }
                }
                EdgeSource::Single(s) => {
                    if target != END {
                        writers
                            .entry(s.clone())
                            .or_default()
                            .push(EdgeWriter::To(target.clone()));
                    }
                }
                EdgeSource::Many(sources) => {
                    let channel = join_channel(sources, target);
                    channels.insert(
                        channel.clone(),
                        Channel::barrier(sources.iter().cloned()),
                    );
                    for s in sources {
                        writers.entry(s.clone()).or_default().push(EdgeWriter::Join {
                            channel: channel.clone(),
                        });
                    }
                }
            }
        }
        for edge in self.conditional_edges {
            if edge.source == START {
                start_writers.push(EdgeWriter::Branch(edge));
            } else {
                writers
                    .entry(edge.source.clone())
                    .or_default()
                    .push(EdgeWriter::Branch(edge));
            }
        }

        // Barrier channels a node is the *target* of become extra triggers.
        let mut extra_triggers: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for (name, channel) in &channels {
            if matches!(channel, Channel::Barrier(_)) {
                if let Some(target) = name.rsplit(':').next() {
                    extra_triggers
                        .entry(target.to_string())
                        .or_default()
                        .push(name.clone());
                }
            }
        }

        let state_read = ChannelRead::Object(
            self.schema
                .field_names()
                .map(|n| (n.to_string(), n.to_string()))
                .collect(),
        );

        let mut specs: FxHashMap<String, NodeSpec> = FxHashMap::default();
        for name in &self.node_order {
            let entry = &self.nodes[name];
            let mut triggers = vec![trigger_channel(name)];
            if let Some(extra) = extra_triggers.get(name) {
                let mut extra = extra.clone();
                extra.sort();
                triggers.extend(extra);
            }
            specs.insert(
                name.clone(),
                NodeSpec {
                    name: name.clone(),
                    channels: state_read.clone(),
                    triggers,
                    mapper: entry.options.mapper.clone(),
                    writers: writers.remove(name).unwrap_or_default(),
                    retry_policy: entry.options.retry_policy.clone(),
                    tags: entry.options.tags.clone(),
                    metadata: entry.options.metadata.clone(),
                    node: entry.node.clone(),
                },
            );
        }

        let mut trigger_to_nodes: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for spec in specs.values() {
            for trigger in &spec.triggers {
                trigger_to_nodes
                    .entry(trigger.clone())
                    .or_default()
                    .push(spec.name.clone());
            }
        }
        for nodes in trigger_to_nodes.values_mut() {
            nodes.sort();
        }

        Ok(App::from_parts(
            self.schema,
            specs,
            channels,
            start_writers,
            trigger_to_nodes,
            self.interrupt_before,
            self.interrupt_after,
            self.saver,
            self.store,
            self.next_version,
        ))
    }
}
