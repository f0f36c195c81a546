//! Graph definition and compilation.
//!
//! The builder is a thin layer over the core's node and channel
//! registration: a [`StateSchema`] binds the user-declared state shape to
//! channels, [`GraphBuilder`] collects nodes and edges, and
//! [`GraphBuilder::compile`] validates the topology into an executable
//! [`App`](crate::app::App).

mod builder;
mod compilation;
pub mod edges;
pub mod schema;

pub use builder::{GraphBuilder, NodeOptions};
pub use compilation::GraphCompileError;
pub use edges::{ConditionalEdge, EdgePredicate, EdgeWriter};
pub use schema::StateSchema;
