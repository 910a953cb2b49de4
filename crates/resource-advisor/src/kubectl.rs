//! Cluster introspection through `kubectl get --raw`.
//!
//! Fetches the OpenAPI v3 document for the resource's group-version
//! (`/openapi/v3/apis/{group}/{version}`, or `/openapi/v3/api/v1` for the
//! core group) and picks the component schema whose
//! `x-kubernetes-group-version-kind` matches the identifier.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use resource_advisor_core::models::ResourceIdentifier;
use resource_advisor_core::schema::{ClusterIntrospection, SchemaDocument};

use crate::config::IntrospectionConfig;

pub struct KubectlIntrospection {
    kubectl: String,
    context: Option<String>,
    timeout: Duration,
}

impl KubectlIntrospection {
    pub fn new(config: &IntrospectionConfig) -> Self {
        Self {
            kubectl: config.kubectl.clone(),
            context: config.context.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Run `kubectl get --raw <path>`. `Ok(None)` when the API server
    /// reports the path as not found.
    async fn get_raw(&self, path: &str) -> Result<Option<Value>> {
        let mut cmd = Command::new(&self.kubectl);
        if let Some(ctx) = &self.context {
            cmd.arg("--context").arg(ctx);
        }
        cmd.arg("get")
            .arg("--raw")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("kubectl timed out after {:?}", self.timeout))?
            .with_context(|| format!("failed to run {}", self.kubectl))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(None);
            }
            bail!("kubectl get --raw {} failed: {}", path, stderr.trim());
        }
        let doc = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("kubectl returned invalid JSON for {}", path))?;
        Ok(Some(doc))
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("could not find the requested resource")
}

/// OpenAPI v3 path for the identifier's group-version.
pub fn openapi_path(id: &ResourceIdentifier) -> String {
    if id.is_core_group() {
        format!("/openapi/v3/api/{}", id.version)
    } else {
        format!("/openapi/v3/apis/{}/{}", id.group, id.version)
    }
}

/// Find and flatten the component schema for `id` in an OpenAPI v3
/// document. `Ok(None)` when no component declares that kind.
pub fn schema_from_document(id: &ResourceIdentifier, doc: &Value) -> Result<Option<SchemaDocument>> {
    let components = doc
        .get("components")
        .and_then(|c| c.get("schemas"))
        .ok_or_else(|| anyhow!("OpenAPI document has no components.schemas"))?;
    let Some(map) = components.as_object() else {
        bail!("OpenAPI components.schemas is not an object");
    };

    let found = map.values().find(|schema| {
        schema
            .get("x-kubernetes-group-version-kind")
            .and_then(Value::as_array)
            .map(|gvks| gvks.iter().any(|gvk| gvk_matches(gvk, id)))
            .unwrap_or(false)
    });
    match found {
        Some(schema) => Ok(Some(SchemaDocument::from_openapi(
            id.clone(),
            schema,
            Some(components),
        )?)),
        None => Ok(None),
    }
}

fn gvk_matches(gvk: &Value, id: &ResourceIdentifier) -> bool {
    let field = |name: &str| gvk.get(name).and_then(Value::as_str).unwrap_or("");
    field("group") == id.group && field("version") == id.version && field("kind") == id.kind
}

#[async_trait]
impl ClusterIntrospection for KubectlIntrospection {
    async fn get_schema(&self, id: &ResourceIdentifier) -> Result<Option<SchemaDocument>> {
        let path = openapi_path(id);
        tracing::debug!(resource = %id, %path, "fetching schema");
        match self.get_raw(&path).await? {
            Some(doc) => schema_from_document(id, &doc),
            None => Ok(None),
        }
    }
}
