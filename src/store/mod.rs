//! Ancillary key/value store exposed to nodes.
//!
//! Long-term memory shared across threads: namespaced items with filtered
//! search, namespace listing, optional TTL, and an optional vector index
//! for semantic search. The engine only consumes this contract; the crate
//! ships the in-memory reference implementation.

pub mod filter;
pub mod memory;

pub use filter::filter_matches;
pub use memory::{DistanceType, InMemoryStore, VectorIndexConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

/// Reserved root namespace label.
pub const RESERVED_NAMESPACE: &str = "stepgraph";

/// Errors from store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("invalid namespace: {message}")]
    #[diagnostic(
        code(stepgraph::store::namespace),
        help("Namespaces are non-empty label sequences; labels may not be empty or contain `.`.")
    )]
    InvalidNamespace { message: String },

    #[error("store backend error: {message}")]
    #[diagnostic(code(stepgraph::store::backend))]
    Backend { message: String },

    #[error("vector search is not configured on this store")]
    #[diagnostic(
        code(stepgraph::store::no_index),
        help("Construct the store with a vector index config to enable semantic queries.")
    )]
    NoVectorIndex,
}

/// Validate a namespace per the contract: a non-empty sequence of non-empty
/// labels, `.`-free, with the reserved label rejected at the root.
pub fn validate_namespace(namespace: &[String]) -> Result<(), StoreError> {
    if namespace.is_empty() {
        return Err(StoreError::InvalidNamespace {
            message: "namespace must have at least one label".to_string(),
        });
    }
    for label in namespace {
        if label.is_empty() {
            return Err(StoreError::InvalidNamespace {
                message: "namespace labels may not be empty".to_string(),
            });
        }
        if label.contains('.') {
            return Err(StoreError::InvalidNamespace {
                message: format!("label `{label}` contains `.`"),
            });
        }
    }
    if namespace[0] == RESERVED_NAMESPACE {
        return Err(StoreError::InvalidNamespace {
            message: format!("label `{RESERVED_NAMESPACE}` is reserved at the root"),
        });
    }
    Ok(())
}

/// A stored item with its bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub namespace: Vec<String>,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Similarity score, set on vector-query results.
    pub score: Option<f32>,
}

/// Options for [`Store::search`].
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    /// Equality/operator filter over item values (dotted paths allowed).
    pub filter: Option<Value>,
    /// Natural-language query for the vector index.
    pub query: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Options for [`Store::list_namespaces`].
#[derive(Clone, Debug, Default)]
pub struct ListNamespacesOptions {
    pub prefix: Option<Vec<String>>,
    pub suffix: Option<Vec<String>>,
    /// Truncate returned namespaces to this depth.
    pub max_depth: Option<usize>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// A single operation in a [`Store::batch`] call.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Get {
        namespace: Vec<String>,
        key: String,
    },
    Put {
        namespace: Vec<String>,
        key: String,
        value: Value,
    },
    Delete {
        namespace: Vec<String>,
        key: String,
    },
}

/// Result of one batched operation.
#[derive(Clone, Debug)]
pub enum BatchResult {
    Item(Option<Item>),
    Done,
}

/// The store contract.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>, StoreError>;

    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError>;

    /// Search under a namespace prefix with optional filter and vector
    /// query; results are score-ordered when a query is given.
    async fn search(
        &self,
        namespace_prefix: &[String],
        options: SearchOptions,
    ) -> Result<Vec<Item>, StoreError>;

    /// Enumerate distinct namespaces, optionally constrained by prefix,
    /// suffix, and depth.
    async fn list_namespaces(
        &self,
        options: ListNamespacesOptions,
    ) -> Result<Vec<Vec<String>>, StoreError>;

    /// Execute several operations; per-op results in order.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, StoreError>;
}
