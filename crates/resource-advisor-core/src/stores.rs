//! Capability and pattern stores: semantic retrieval over a [`VectorIndex`].
//!
//! Both stores share one contract, implemented once by [`SemanticStore`]:
//!
//! 1. Embed the query with the configured [`EmbeddingProvider`].
//! 2. Run nearest-neighbour search against the store's collection.
//! 3. Drop hits below the minimum-score floor (never ranked last).
//! 4. Decode payloads into typed records.
//!
//! A failing backend never fails the request: the store returns an empty
//! [`Retrieval`] carrying a `degraded` reason instead.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::embedding::EmbeddingProvider;
use crate::index::{PayloadFilter, VectorIndex, VectorPoint};
use crate::models::{CapabilityRecord, Hit, PatternRecord, ResourceIdentifier};

/// A record type that can live in a vector collection.
pub trait IndexedRecord: Sized + Send + Sync {
    /// Stable point id for this record.
    fn point_id(&self) -> String;
    /// Text the sync process embeds for this record.
    fn embedding_text(&self) -> String;
    /// The stored embedding, if the record carries one.
    fn embedding(&self) -> &[f32];
    /// Decode a record from a point payload.
    fn from_payload(payload: &Value) -> Result<Self>;
    /// Encode the record as a point payload.
    fn to_payload(&self) -> Result<Value>;

    /// Build a [`VectorPoint`] using the record's own embedding.
    fn to_point(&self) -> Result<VectorPoint> {
        Ok(VectorPoint {
            id: self.point_id(),
            vector: self.embedding().to_vec(),
            payload: self.to_payload()?,
        })
    }
}

impl IndexedRecord for CapabilityRecord {
    fn point_id(&self) -> String {
        self.id.to_string()
    }

    fn embedding_text(&self) -> String {
        let mut text = format!("{} {}", self.id.kind, self.description);
        for tag in self.capability_tags.iter().chain(self.provider_tags.iter()) {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }

    fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).context("invalid capability payload")
    }

    fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl IndexedRecord for PatternRecord {
    fn point_id(&self) -> String {
        self.id.clone()
    }

    fn embedding_text(&self) -> String {
        self.trigger_description.clone()
    }

    fn embedding(&self) -> &[f32] {
        &self.embedding
    }

    fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).context("invalid pattern payload")
    }

    fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Hits from one store query, plus the degradation reason if the backend
/// could not be reached.
#[derive(Debug, Clone)]
pub struct Retrieval<T> {
    pub hits: Vec<Hit<T>>,
    pub degraded: Option<String>,
}

impl<T> Retrieval<T> {
    pub fn empty() -> Self {
        Self {
            hits: Vec::new(),
            degraded: None,
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self {
            hits: Vec::new(),
            degraded: Some(reason.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Semantic retrieval over one collection of `R` records.
pub struct SemanticStore<R> {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    min_score: f32,
    _record: PhantomData<fn() -> R>,
}

pub type CapabilityStore = SemanticStore<CapabilityRecord>;
pub type PatternStore = SemanticStore<PatternRecord>;

impl<R: IndexedRecord> SemanticStore<R> {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        collection: impl Into<String>,
        min_score: f32,
    ) -> Self {
        Self {
            index,
            embedder,
            collection: collection.into(),
            min_score,
            _record: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Return up to `limit` hits for `query`, ordered by descending score.
    pub async fn search(&self, query: &str, limit: usize) -> Retrieval<R> {
        if query.trim().is_empty() || limit == 0 {
            return Retrieval::empty();
        }

        let vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(collection = %self.collection, error = %e, "query embedding failed");
                return Retrieval::degraded(format!("embedding failed: {}", e));
            }
        };

        let points = match self
            .index
            .search_by_embedding(&self.collection, &vector, limit)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(collection = %self.collection, error = %e, "vector search failed");
                return Retrieval::degraded(format!("vector search failed: {}", e));
            }
        };

        let mut hits = Vec::with_capacity(points.len());
        for point in points {
            if point.score < self.min_score {
                continue;
            }
            match R::from_payload(&point.payload) {
                Ok(record) => hits.push(Hit {
                    record,
                    score: point.score.clamp(0.0, 1.0),
                }),
                Err(e) => {
                    tracing::warn!(collection = %self.collection, point = %point.id, error = %e, "skipping undecodable point");
                }
            }
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        tracing::debug!(collection = %self.collection, hits = hits.len(), "semantic search complete");
        Retrieval {
            hits,
            degraded: None,
        }
    }

    /// Fetch one record by point id.
    pub async fn get(&self, id: &str) -> Result<Option<R>> {
        match self.index.get(&self.collection, id).await? {
            Some(point) => Ok(Some(R::from_payload(&point.payload)?)),
            None => Ok(None),
        }
    }
}

impl CapabilityStore {
    /// Identifiers of up to `limit` indexed resource types.
    ///
    /// Used to build the per-request kind catalog.
    pub async fn identifiers(&self, limit: usize) -> Result<Vec<ResourceIdentifier>> {
        let points = self
            .index
            .scan_payloads(&self.collection, &PayloadFilter::all(), limit)
            .await?;
        Ok(points
            .iter()
            .filter_map(|p| p.payload.get("id"))
            .filter_map(|v| ResourceIdentifier::from_value(v).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::index::memory::InMemoryVectorIndex;
    use crate::index::{PayloadPoint, ScoredPoint};
    use crate::models::ComplexityTier;
    use async_trait::async_trait;

    fn capability(group: &str, kind: &str, description: &str, embedder: &HashingEmbedder) -> CapabilityRecord {
        let mut record = CapabilityRecord {
            id: ResourceIdentifier::new(group, "v1", kind),
            description: description.to_string(),
            capability_tags: Default::default(),
            provider_tags: Default::default(),
            complexity_tier: ComplexityTier::Medium,
            embedding: Vec::new(),
        };
        record.embedding = embedder.embed_text(&record.embedding_text());
        record
    }

    async fn seeded() -> (Arc<InMemoryVectorIndex>, Arc<HashingEmbedder>) {
        let index = Arc::new(InMemoryVectorIndex::new());
        let embedder = Arc::new(HashingEmbedder::new(256));
        let records = vec![
            capability("db.example.io", "PostgresServer", "managed postgresql database server", &embedder),
            capability("apps", "Deployment", "stateless application workload", &embedder),
            capability("cache.example.io", "Redis", "in-memory cache", &embedder),
        ];
        let points = records.iter().map(|r| r.to_point().unwrap()).collect();
        index.upsert("capabilities", points).await.unwrap();
        (index, embedder)
    }

    #[tokio::test]
    async fn test_search_applies_floor() {
        let (index, embedder) = seeded().await;
        let store = CapabilityStore::new(index, embedder, "capabilities", 0.2);
        let result = store.search("postgresql database", 10).await;
        assert!(!result.is_degraded());
        assert_eq!(result.hits.len(), 1, "unrelated records must be dropped, not ranked last");
        assert_eq!(result.hits[0].record.id.kind, "PostgresServer");
    }

    #[tokio::test]
    async fn test_identifiers_lists_catalog() {
        let (index, embedder) = seeded().await;
        let store = CapabilityStore::new(index, embedder, "capabilities", 0.2);
        let ids = store.identifiers(100).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().any(|id| id.kind == "Redis"));
    }

    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        async fn upsert(&self, _: &str, _: Vec<VectorPoint>) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn search_by_embedding(&self, _: &str, _: &[f32], _: usize) -> Result<Vec<ScoredPoint>> {
            anyhow::bail!("connection refused")
        }
        async fn search_by_filter(&self, _: &str, _: &PayloadFilter, _: usize) -> Result<Vec<VectorPoint>> {
            anyhow::bail!("connection refused")
        }
        async fn get(&self, _: &str, _: &str) -> Result<Option<VectorPoint>> {
            anyhow::bail!("connection refused")
        }
        async fn delete(&self, _: &str, _: &str) -> Result<bool> {
            anyhow::bail!("connection refused")
        }
    }

    /// Refuses vector transfers, so only payload scans succeed.
    struct PayloadOnly(Arc<InMemoryVectorIndex>);

    #[async_trait]
    impl VectorIndex for PayloadOnly {
        async fn upsert(&self, c: &str, points: Vec<VectorPoint>) -> Result<()> {
            self.0.upsert(c, points).await
        }
        async fn search_by_embedding(&self, c: &str, v: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
            self.0.search_by_embedding(c, v, limit).await
        }
        async fn search_by_filter(&self, _: &str, _: &PayloadFilter, _: usize) -> Result<Vec<VectorPoint>> {
            anyhow::bail!("vectors requested")
        }
        async fn scan_payloads(&self, c: &str, f: &PayloadFilter, limit: usize) -> Result<Vec<PayloadPoint>> {
            self.0.scan_payloads(c, f, limit).await
        }
        async fn get(&self, c: &str, id: &str) -> Result<Option<VectorPoint>> {
            self.0.get(c, id).await
        }
        async fn delete(&self, c: &str, id: &str) -> Result<bool> {
            self.0.delete(c, id).await
        }
    }

    #[tokio::test]
    async fn test_identifiers_skip_vectors() {
        let (index, embedder) = seeded().await;
        let store = CapabilityStore::new(Arc::new(PayloadOnly(index)), embedder, "capabilities", 0.2);
        let ids = store.identifiers(2).await.unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades() {
        let store = PatternStore::new(Arc::new(DownIndex), Arc::new(HashingEmbedder::new(16)), "patterns", 0.5);
        let result = store.search("anything", 5).await;
        assert!(result.hits.is_empty());
        assert!(result.degraded.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_pattern_roundtrip_through_index() {
        let index = Arc::new(InMemoryVectorIndex::new());
        let embedder = Arc::new(HashingEmbedder::new(128));
        let mut pattern = PatternRecord {
            id: "azure-rg".into(),
            trigger_description: "Azure managed database".into(),
            suggested_resources: vec![ResourceIdentifier::new("resources.azure.com", "v1", "ResourceGroup")],
            rationale: "Azure resources live in a resource group".into(),
            embedding: Vec::new(),
        };
        pattern.embedding = embedder.embed_text(&pattern.embedding_text());
        index.upsert("patterns", vec![pattern.to_point().unwrap()]).await.unwrap();

        let store = PatternStore::new(index, embedder, "patterns", 0.3);
        let fetched = store.get("azure-rg").await.unwrap().unwrap();
        assert_eq!(fetched.suggested_resources, pattern.suggested_resources);
        let result = store.search("database in Azure", 3).await;
        assert_eq!(result.hits.len(), 1);
    }
}
