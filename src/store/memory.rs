//! In-memory store with TTL and an optional vector index.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::filter::filter_matches;
use super::{
    validate_namespace, BatchOp, BatchResult, Item, ListNamespacesOptions, SearchOptions, Store,
    StoreError,
};

/// Embedding function used by the vector index.
pub type EmbedFn = Arc<dyn Fn(&[String]) -> Vec<Vec<f32>> + Send + Sync>;

/// Distance metric for the vector index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceType {
    Cosine,
    L2,
    InnerProduct,
}

/// Configuration of the optional vector index.
#[derive(Clone)]
pub struct VectorIndexConfig {
    pub dims: usize,
    pub embed: EmbedFn,
    pub distance: DistanceType,
    /// Dotted paths of the fields to embed; the whole value when empty.
    pub fields: Vec<String>,
    /// Drop results scoring below this threshold.
    pub similarity_threshold: Option<f32>,
}

impl std::fmt::Debug for VectorIndexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndexConfig")
            .field("dims", &self.dims)
            .field("distance", &self.distance)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct StoredItem {
    value: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    embedding: Option<Vec<f32>>,
}

type NamespaceKey = Vec<String>;

/// Volatile reference implementation of the [`Store`] contract.
pub struct InMemoryStore {
    items: RwLock<BTreeMap<NamespaceKey, BTreeMap<String, StoredItem>>>,
    ttl: Option<Duration>,
    refresh_on_read: bool,
    index: Option<VectorIndexConfig>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            ttl: None,
            refresh_on_read: false,
            index: None,
        }
    }

    /// Expire items `ttl` after their last write (or read, with
    /// `refresh_on_read`).
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration, refresh_on_read: bool) -> Self {
        self.ttl = Some(ttl);
        self.refresh_on_read = refresh_on_read;
        self
    }

    /// Enable semantic search over stored values.
    #[must_use]
    pub fn with_vector_index(mut self, config: VectorIndexConfig) -> Self {
        self.index = Some(config);
        self
    }

    fn is_expired(item: &StoredItem, now: DateTime<Utc>) -> bool {
        item.expires_at.is_some_and(|at| at <= now)
    }

    fn embed_text(&self, value: &Value) -> Option<Vec<f32>> {
        let index = self.index.as_ref()?;
        let text = if index.fields.is_empty() {
            value.to_string()
        } else {
            index
                .fields
                .iter()
                .filter_map(|path| {
                    let mut current = value;
                    for segment in path.split('.') {
                        current = current.get(segment)?;
                    }
                    Some(match current {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        (index.embed)(&[text]).into_iter().next()
    }

    fn score(&self, query: &[f32], embedding: &[f32]) -> f32 {
        let Some(index) = &self.index else { return 0.0 };
        match index.distance {
            DistanceType::InnerProduct => dot(query, embedding),
            DistanceType::Cosine => {
                let denom = norm(query) * norm(embedding);
                if denom == 0.0 {
                    0.0
                } else {
                    dot(query, embedding) / denom
                }
            }
            DistanceType::L2 => {
                let dist: f32 = query
                    .iter()
                    .zip(embedding)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f32>()
                    .sqrt();
                // Higher is better across all metrics.
                -dist
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, namespace: &[String], key: &str) -> Result<Option<Item>, StoreError> {
        validate_namespace(namespace)?;
        let now = Utc::now();
        let mut guard = self.items.write();
        let Some(bucket) = guard.get_mut(namespace) else {
            return Ok(None);
        };
        let Some(item) = bucket.get_mut(key) else {
            return Ok(None);
        };
        if Self::is_expired(item, now) {
            bucket.remove(key);
            return Ok(None);
        }
        if self.refresh_on_read {
            if let Some(ttl) = self.ttl {
                item.expires_at = Some(
                    now + chrono::Duration::from_std(ttl).unwrap_or_default(),
                );
            }
        }
        Ok(Some(Item {
            namespace: namespace.to_vec(),
            key: key.to_string(),
            value: item.value.clone(),
            created_at: item.created_at,
            updated_at: item.updated_at,
            score: None,
        }))
    }

    async fn put(
        &self,
        namespace: &[String],
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        validate_namespace(namespace)?;
        let now = Utc::now();
        let embedding = self.embed_text(&value);
        let mut guard = self.items.write();
        let bucket = guard.entry(namespace.to_vec()).or_default();
        let created_at = bucket.get(key).map_or(now, |existing| existing.created_at);
        bucket.insert(
            key.to_string(),
            StoredItem {
                value,
                created_at,
                updated_at: now,
                expires_at: self
                    .ttl
                    .map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or_default()),
                embedding,
            },
        );
        Ok(())
    }

    async fn delete(&self, namespace: &[String], key: &str) -> Result<(), StoreError> {
        validate_namespace(namespace)?;
        let mut guard = self.items.write();
        if let Some(bucket) = guard.get_mut(namespace) {
            bucket.remove(key);
            if bucket.is_empty() {
                guard.remove(namespace);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace_prefix: &[String],
        options: SearchOptions,
    ) -> Result<Vec<Item>, StoreError> {
        let now = Utc::now();
        let query_embedding = match &options.query {
            Some(query) => {
                let index = self.index.as_ref().ok_or(StoreError::NoVectorIndex)?;
                Some(
                    (index.embed)(&[query.clone()])
                        .into_iter()
                        .next()
                        .unwrap_or_default(),
                )
            }
            None => None,
        };

        let guard = self.items.read();
        let mut results: Vec<Item> = Vec::new();
        for (namespace, bucket) in guard.iter() {
            if namespace.len() < namespace_prefix.len()
                || namespace[..namespace_prefix.len()] != *namespace_prefix
            {
                continue;
            }
            for (key, stored) in bucket {
                if Self::is_expired(stored, now) {
                    continue;
                }
                if let Some(filter) = &options.filter {
                    if !filter_matches(filter, &stored.value) {
                        continue;
                    }
                }
                let score = match (&query_embedding, &stored.embedding) {
                    (Some(query), Some(embedding)) => Some(self.score(query, embedding)),
                    (Some(_), None) => continue,
                    _ => None,
                };
                if let (Some(score), Some(threshold)) = (
                    score,
                    self.index
                        .as_ref()
                        .and_then(|i| i.similarity_threshold),
                ) {
                    if score < threshold {
                        continue;
                    }
                }
                results.push(Item {
                    namespace: namespace.clone(),
                    key: key.clone(),
                    value: stored.value.clone(),
                    created_at: stored.created_at,
                    updated_at: stored.updated_at,
                    score,
                });
            }
        }

        if query_embedding.is_some() {
            results.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            results.sort_by(|a, b| (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key)));
        }

        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_namespaces(
        &self,
        options: ListNamespacesOptions,
    ) -> Result<Vec<Vec<String>>, StoreError> {
        let guard = self.items.read();
        let mut namespaces: Vec<Vec<String>> = Vec::new();
        for namespace in guard.keys() {
            if let Some(prefix) = &options.prefix {
                if namespace.len() < prefix.len() || namespace[..prefix.len()] != *prefix {
                    continue;
                }
            }
            if let Some(suffix) = &options.suffix {
                if namespace.len() < suffix.len()
                    || namespace[namespace.len() - suffix.len()..] != *suffix
                {
                    continue;
                }
            }
            let truncated = match options.max_depth {
                Some(depth) => namespace.iter().take(depth).cloned().collect(),
                None => namespace.clone(),
            };
            if !namespaces.contains(&truncated) {
                namespaces.push(truncated);
            }
        }
        namespaces.sort();
        let offset = options.offset.unwrap_or(0);
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(namespaces.into_iter().skip(offset).take(limit).collect())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<Vec<BatchResult>, StoreError> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BatchOp::Get { namespace, key } => {
                    results.push(BatchResult::Item(self.get(&namespace, &key).await?));
                }
                BatchOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    self.put(&namespace, &key, value).await?;
                    results.push(BatchResult::Done);
                }
                BatchOp::Delete { namespace, key } => {
                    self.delete(&namespace, &key).await?;
                    results.push(BatchResult::Done);
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = InMemoryStore::new();
        store
            .put(&ns(&["users", "ada"]), "profile", json!({"age": 36}))
            .await
            .unwrap();
        let item = store
            .get(&ns(&["users", "ada"]), "profile")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.value["age"], 36);

        store.delete(&ns(&["users", "ada"]), "profile").await.unwrap();
        assert!(store
            .get(&ns(&["users", "ada"]), "profile")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn search_with_filter_and_prefix() {
        let store = InMemoryStore::new();
        store
            .put(&ns(&["users", "ada"]), "p", json!({"role": "admin"}))
            .await
            .unwrap();
        store
            .put(&ns(&["users", "bob"]), "p", json!({"role": "viewer"}))
            .await
            .unwrap();
        store
            .put(&ns(&["teams"]), "t", json!({"role": "admin"}))
            .await
            .unwrap();

        let hits = store
            .search(
                &ns(&["users"]),
                SearchOptions {
                    filter: Some(json!({"role": "admin"})),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].namespace, ns(&["users", "ada"]));
    }

    #[tokio::test]
    async fn list_namespaces_with_depth() {
        let store = InMemoryStore::new();
        store
            .put(&ns(&["users", "ada", "notes"]), "n", json!(1))
            .await
            .unwrap();
        store
            .put(&ns(&["users", "bob", "notes"]), "n", json!(1))
            .await
            .unwrap();

        let namespaces = store
            .list_namespaces(ListNamespacesOptions {
                prefix: Some(ns(&["users"])),
                max_depth: Some(2),
                ..ListNamespacesOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(namespaces, vec![ns(&["users", "ada"]), ns(&["users", "bob"])]);
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity() {
        let embed: EmbedFn = Arc::new(|texts| {
            texts
                .iter()
                .map(|t| {
                    // toy embedding: [len, vowels]
                    let vowels =
                        t.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
                    vec![t.len() as f32, vowels]
                })
                .collect()
        });
        let store = InMemoryStore::new().with_vector_index(VectorIndexConfig {
            dims: 2,
            embed,
            distance: DistanceType::Cosine,
            fields: vec!["text".to_string()],
            similarity_threshold: None,
        });
        store
            .put(&ns(&["docs"]), "a", json!({"text": "aaaa"}))
            .await
            .unwrap();
        store
            .put(&ns(&["docs"]), "b", json!({"text": "zzzzzzzz"}))
            .await
            .unwrap();

        let hits = store
            .search(
                &ns(&["docs"]),
                SearchOptions {
                    query: Some("aaaa".to_string()),
                    ..SearchOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits[0].key, "a");
        assert!(hits[0].score.unwrap() >= hits[1].score.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_items() {
        let store = InMemoryStore::new().with_ttl(Duration::from_millis(0), false);
        store.put(&ns(&["tmp"]), "k", json!(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get(&ns(&["tmp"]), "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_runs_in_order() {
        let store = InMemoryStore::new();
        let results = store
            .batch(vec![
                BatchOp::Put {
                    namespace: ns(&["b"]),
                    key: "k".to_string(),
                    value: json!(1),
                },
                BatchOp::Get {
                    namespace: ns(&["b"]),
                    key: "k".to_string(),
                },
                BatchOp::Delete {
                    namespace: ns(&["b"]),
                    key: "k".to_string(),
                },
                BatchOp::Get {
                    namespace: ns(&["b"]),
                    key: "k".to_string(),
                },
            ])
            .await
            .unwrap();
        assert!(matches!(&results[1], BatchResult::Item(Some(item)) if item.value == json!(1)));
        assert!(matches!(&results[3], BatchResult::Item(None)));
    }
}
