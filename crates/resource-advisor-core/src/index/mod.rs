//! Vector index abstraction for Resource Advisor.
//!
//! The [`VectorIndex`] trait defines the operations the capability and
//! pattern stores need from a vector database, enabling pluggable backends
//! (Qdrant over HTTP, in-memory for tests).
//!
//! Implementations must be `Send + Sync`; a single instance is shared
//! read-only across concurrent requests.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// A stored point: stable string id, embedding, and JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A point returned from similarity search.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    /// Cosine similarity reported by the backend.
    pub score: f32,
    pub payload: Value,
}

/// A stored point without its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadPoint {
    pub id: String,
    pub payload: Value,
}

/// Equality filter over payload fields.
///
/// A condition matches when the payload field equals the value, or when
/// the field is an array containing the value. All conditions must match.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub must: Vec<FieldCondition>,
}

#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub key: String,
    pub value: Value,
}

impl PayloadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push(FieldCondition {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Evaluate the filter against a payload. Dotted keys address nested
    /// objects.
    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|cond| {
            let mut cursor = payload;
            for part in cond.key.split('.') {
                match cursor.get(part) {
                    Some(next) => cursor = next,
                    None => return false,
                }
            }
            match cursor {
                Value::Array(items) => items.contains(&cond.value),
                other => *other == cond.value,
            }
        })
    }
}

/// Abstract vector database client.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace points by id |
/// | [`search_by_embedding`](VectorIndex::search_by_embedding) | Nearest-neighbour search |
/// | [`search_by_filter`](VectorIndex::search_by_filter) | Payload-filtered scan |
/// | [`scan_payloads`](VectorIndex::scan_payloads) | Payload-filtered scan, no vectors |
/// | [`get`](VectorIndex::get) | Fetch one point by id |
/// | [`delete`](VectorIndex::delete) | Remove one point by id |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace points in a collection.
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Return up to `limit` points ordered by descending similarity.
    async fn search_by_embedding(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    /// Return up to `limit` points whose payload matches `filter`.
    async fn search_by_filter(
        &self,
        collection: &str,
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<VectorPoint>>;

    /// Like [`search_by_filter`](VectorIndex::search_by_filter) but
    /// returns payloads only. Remote backends should override this to skip
    /// transferring vectors.
    async fn scan_payloads(
        &self,
        collection: &str,
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<PayloadPoint>> {
        Ok(self
            .search_by_filter(collection, filter, limit)
            .await?
            .into_iter()
            .map(|p| PayloadPoint {
                id: p.id,
                payload: p.payload,
            })
            .collect())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorPoint>>;

    /// Remove a point. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;
}
