//! Qdrant REST backend for [`VectorIndex`].
//!
//! Qdrant point ids must be unsigned integers or UUIDs, so each record id
//! is mapped to a UUID v5 (namespaced by collection) and the original id
//! is kept in the payload under `_id`.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | upsert | `PUT /collections/{c}/points?wait=true` |
//! | search | `POST /collections/{c}/points/search` |
//! | filter | `POST /collections/{c}/points/scroll` |
//! | payload scan | `POST /collections/{c}/points/scroll` (`with_vector: false`) |
//! | get | `GET /collections/{c}/points/{uuid}` |
//! | delete | `POST /collections/{c}/points/delete?wait=true` |

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use resource_advisor_core::index::{PayloadFilter, PayloadPoint, ScoredPoint, VectorIndex, VectorPoint};

use crate::config::VectorConfig;
use crate::http::client;

const ID_FIELD: &str = "_id";

pub struct QdrantIndex {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl QdrantIndex {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .with_context(|| format!("{} environment variable not set", var))?,
            ),
            None => None,
        };
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            client: client(config.timeout_secs)?,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    fn points_url(&self, collection: &str, suffix: &str) -> String {
        format!("{}/collections/{}/points{}", self.base_url, collection, suffix)
    }

    /// Page through `/scroll` until `limit` raw points are collected.
    async fn scroll(
        &self,
        collection: &str,
        filter: &PayloadFilter,
        limit: usize,
        with_vector: bool,
    ) -> Result<Vec<Value>> {
        let mut points = Vec::new();
        let mut offset: Option<Value> = None;

        while points.len() < limit {
            let body = scroll_body(filter, limit - points.len(), offset.as_ref(), with_vector);
            let resp = self
                .request(self.client.post(self.points_url(collection, "/scroll")))
                .json(&body)
                .send()
                .await?;
            let json = check(resp, "scroll").await?;
            let result = json
                .get("result")
                .ok_or_else(|| anyhow!("Invalid Qdrant scroll response: missing result"))?;
            let page = result
                .get("points")
                .and_then(|p| p.as_array())
                .cloned()
                .unwrap_or_default();
            let exhausted = page.is_empty();
            points.extend(page);
            offset = result.get("next_page_offset").filter(|v| !v.is_null()).cloned();
            if offset.is_none() || exhausted {
                break;
            }
        }
        points.truncate(limit);
        Ok(points)
    }
}

/// Deterministic Qdrant point id for a record id.
pub fn point_uuid(collection: &str, id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{}/{}", collection, id).as_bytes())
}

fn scroll_body(filter: &PayloadFilter, remaining: usize, offset: Option<&Value>, with_vector: bool) -> Value {
    let mut body = json!({
        "filter": filter_json(filter),
        "limit": remaining.min(256),
        "with_payload": true,
        "with_vector": with_vector,
    });
    if let Some(off) = offset {
        body["offset"] = off.clone();
    }
    body
}

fn filter_json(filter: &PayloadFilter) -> Value {
    let must: Vec<Value> = filter
        .must
        .iter()
        .map(|cond| json!({ "key": cond.key, "match": { "value": cond.value } }))
        .collect();
    json!({ "must": must })
}

fn payload_with_id(id: &str, payload: Value) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

/// Split a stored payload into the record id and the record payload.
fn split_payload(mut payload: Value) -> Result<(String, Value)> {
    let id = payload
        .as_object_mut()
        .and_then(|map| map.remove(ID_FIELD))
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| anyhow!("Qdrant point payload is missing '{}'", ID_FIELD))?;
    Ok((id, payload))
}

fn parse_vector(point: &Value) -> Vec<f32> {
    point
        .get("vector")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().map(|x| x.as_f64().unwrap_or(0.0) as f32).collect())
        .unwrap_or_default()
}

fn parse_point(point: &Value) -> Result<VectorPoint> {
    let payload = point.get("payload").cloned().unwrap_or(Value::Null);
    let (id, payload) = split_payload(payload)?;
    Ok(VectorPoint {
        id,
        vector: parse_vector(point),
        payload,
    })
}

async fn check(resp: reqwest::Response, op: &str) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("Qdrant {} failed ({}): {}", op, status, body);
    }
    Ok(resp.json().await?)
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = points
            .into_iter()
            .map(|p| {
                json!({
                    "id": point_uuid(collection, &p.id).to_string(),
                    "vector": p.vector,
                    "payload": payload_with_id(&p.id, p.payload),
                })
            })
            .collect();
        let resp = self
            .request(self.client.put(self.points_url(collection, "?wait=true")))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check(resp, "upsert").await?;
        Ok(())
    }

    async fn search_by_embedding(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let body = json!({ "vector": vector, "limit": limit, "with_payload": true });
        let resp = self
            .request(self.client.post(self.points_url(collection, "/search")))
            .json(&body)
            .send()
            .await?;
        let json = check(resp, "search").await?;
        let results = json
            .get("result")
            .and_then(|r| r.as_array())
            .ok_or_else(|| anyhow!("Invalid Qdrant search response: missing result"))?;

        let mut hits = Vec::with_capacity(results.len());
        for item in results {
            let score = item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32;
            let payload = item.get("payload").cloned().unwrap_or(Value::Null);
            match split_payload(payload) {
                Ok((id, payload)) => hits.push(ScoredPoint { id, score, payload }),
                Err(e) => tracing::warn!(%collection, error = %e, "skipping foreign point"),
            }
        }
        Ok(hits)
    }

    async fn search_by_filter(
        &self,
        collection: &str,
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<VectorPoint>> {
        self.scroll(collection, filter, limit, true)
            .await?
            .iter()
            .map(parse_point)
            .collect()
    }

    async fn scan_payloads(
        &self,
        collection: &str,
        filter: &PayloadFilter,
        limit: usize,
    ) -> Result<Vec<PayloadPoint>> {
        self.scroll(collection, filter, limit, false)
            .await?
            .into_iter()
            .map(|point| {
                let (id, payload) = split_payload(point.get("payload").cloned().unwrap_or(Value::Null))?;
                Ok(PayloadPoint { id, payload })
            })
            .collect()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<VectorPoint>> {
        let url = self.points_url(collection, &format!("/{}", point_uuid(collection, id)));
        let resp = self.request(self.client.get(url)).send().await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let json = check(resp, "get").await?;
        match json.get("result") {
            Some(point) if !point.is_null() => Ok(Some(parse_point(point)?)),
            _ => Ok(None),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        if self.get(collection, id).await?.is_none() {
            return Ok(false);
        }
        let body = json!({ "points": [point_uuid(collection, id).to_string()] });
        let resp = self
            .request(self.client.post(self.points_url(collection, "/delete?wait=true")))
            .json(&body)
            .send()
            .await?;
        check(resp, "delete").await?;
        Ok(true)
    }
}
