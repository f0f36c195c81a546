//! # Stepgraph: a Pregel-style engine for stateful agent graphs
//!
//! Stepgraph executes programs expressed as directed graphs of **nodes**
//! that communicate by reading and writing named **channels**. The engine
//! advances in discrete, barrier-synchronized **supersteps**, checkpoints
//! state between steps, supports interruption and resumption, fans out
//! dynamically through send packets, and routes deterministically through
//! conditional edges.
//!
//! ## Core concepts
//!
//! - **Channels**: typed, versioned mailboxes with reduction rules
//! - **Nodes**: async computations fired by channel version changes
//! - **Checkpoints**: immutable snapshots at superstep boundaries
//! - **Commands / sends / interrupts**: control flow as values
//! - **Streams**: resumable, mode-tagged event delivery
//!
//! ## Quick start
//!
//! ```no_run
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use stepgraph::channels::Channel;
//! use stepgraph::graphs::{GraphBuilder, StateSchema};
//! use stepgraph::node::{Node, NodeContext, NodeError, NodeOutput};
//! use stepgraph::runtimes::RuntimeConfig;
//!
//! struct Increment;
//!
//! #[async_trait]
//! impl Node for Increment {
//!     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!         let n = input["input"].as_i64().unwrap_or_default();
//!         Ok(NodeOutput::write("output", json!(n + 1)))
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let app = GraphBuilder::new(
//!     StateSchema::new()
//!         .field("input", Channel::last_value())
//!         .field("output", Channel::last_value()),
//! )
//! .add_node("one", Increment)
//! .set_entry("one")
//! .add_terminal_edge("one")
//! .compile()?;
//!
//! let out = app.invoke(json!(2), RuntimeConfig::new()).await?;
//! assert_eq!(out.values().unwrap()["output"], json!(3));
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`channels`] - channel variants and their reduction semantics
//! - [`checkpoint`] - snapshots, savers, pending writes
//! - [`node`] - the node trait, context, and outputs
//! - [`control`] - sends, commands, interrupts
//! - [`graphs`] - state schema binding, builder, compilation
//! - [`algo`] - superstep primitives (task selection, write commit)
//! - [`runtimes`] - the loop, the task runner, retries, cancellation
//! - [`stream`] - resumable event streaming
//! - [`store`] - ancillary key/value store exposed to nodes

pub mod algo;
pub mod app;
pub mod channels;
pub mod checkpoint;
pub mod control;
pub mod graphs;
pub mod node;
pub mod runtimes;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod types;

pub use app::{App, StateView, SubgraphNode, TaskView};
pub use runtimes::{GraphInput, GraphOutput, LoopError, RuntimeConfig};
