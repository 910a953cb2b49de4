//! Resource schema documents and the cluster introspection interface.
//!
//! A [`SchemaDocument`] is a flattened view of a resource's OpenAPI v3
//! schema: one [`SchemaField`] per property below `spec`, with its dotted
//! path, type, and optionality. The dependency resolver only ever looks at
//! this flattened form.
//!
//! # Flattening rules
//!
//! - `$ref` (`#/components/schemas/...`) and single-element `allOf`
//!   wrappers are resolved against the document's components.
//! - `metadata`, `status`, `apiVersion` and `kind` are skipped.
//! - The top-level `spec` counts as required even when the schema does not
//!   list it; everything below follows the schema's `required` arrays.
//! - Fields under an array (`spec.rules[].name`) are never path-required.
//! - Recursion stops at [`MAX_SCHEMA_DEPTH`] to survive cyclic references.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::models::ResourceIdentifier;

pub const MAX_SCHEMA_DEPTH: usize = 12;

const SKIPPED_ROOT_FIELDS: &[&str] = &["metadata", "status", "apiVersion", "kind"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Unknown,
}

/// One property in a flattened schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    /// Dotted path from the resource root, e.g. `spec.owner.name`.
    pub path: String,
    /// Last path segment, e.g. `name`.
    pub name: String,
    pub field_type: FieldType,
    /// Listed in the parent's `required` array.
    pub required: bool,
    /// Required at every level from `spec` down to this field.
    pub path_required: bool,
    pub description: Option<String>,
}

/// The flattened schema of one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDocument {
    pub id: ResourceIdentifier,
    pub fields: Vec<SchemaField>,
}

impl SchemaDocument {
    pub fn new(id: ResourceIdentifier, fields: Vec<SchemaField>) -> Self {
        Self { id, fields }
    }

    pub fn field(&self, path: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.path == path)
    }

    /// Flatten an OpenAPI v3 resource schema.
    ///
    /// `components` is the `components.schemas` map used to resolve
    /// `$ref`s; pass `None` for self-contained CRD schemas.
    pub fn from_openapi(
        id: ResourceIdentifier,
        schema: &Value,
        components: Option<&Value>,
    ) -> Result<Self> {
        let root = resolve(schema, components, 0);
        let props = match root.get("properties").and_then(Value::as_object) {
            Some(p) => p,
            None => bail!("schema for {} has no properties", id),
        };
        let required = required_set(root);

        let mut fields = Vec::new();
        for (name, node) in props {
            if SKIPPED_ROOT_FIELDS.contains(&name.as_str()) {
                continue;
            }
            let is_required = name == "spec" || required.contains(&name.as_str());
            walk(
                name,
                name,
                node,
                components,
                is_required,
                is_required,
                1,
                &mut fields,
            );
        }
        Ok(Self { id, fields })
    }
}

fn required_set(node: &Value) -> Vec<&str> {
    node.get("required")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn resolve<'a>(node: &'a Value, components: Option<&'a Value>, depth: usize) -> &'a Value {
    if depth > MAX_SCHEMA_DEPTH {
        return node;
    }
    if let Some(reference) = node.get("$ref").and_then(Value::as_str) {
        let name = reference.rsplit('/').next().unwrap_or(reference);
        if let Some(target) = components.and_then(|c| c.get(name)) {
            return resolve(target, components, depth + 1);
        }
        return node;
    }
    if node.get("properties").is_none() {
        if let Some([single]) = node.get("allOf").and_then(Value::as_array).map(Vec::as_slice) {
            return resolve(single, components, depth + 1);
        }
    }
    node
}

fn field_type(node: &Value) -> FieldType {
    if node.get("x-kubernetes-int-or-string").and_then(Value::as_bool) == Some(true) {
        return FieldType::String;
    }
    match node.get("type").and_then(Value::as_str) {
        Some("string") => FieldType::String,
        Some("integer") => FieldType::Integer,
        Some("number") => FieldType::Number,
        Some("boolean") => FieldType::Boolean,
        Some("object") => FieldType::Object,
        Some("array") => FieldType::Array,
        _ if node.get("properties").is_some() => FieldType::Object,
        _ => FieldType::Unknown,
    }
}

#[allow(clippy::too_many_arguments)]
fn walk(
    path: &str,
    name: &str,
    raw: &Value,
    components: Option<&Value>,
    required: bool,
    path_required: bool,
    depth: usize,
    out: &mut Vec<SchemaField>,
) {
    let node = resolve(raw, components, depth);
    let description = raw
        .get("description")
        .or_else(|| node.get("description"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let ty = field_type(node);
    out.push(SchemaField {
        path: path.to_string(),
        name: name.to_string(),
        field_type: ty,
        required,
        path_required,
        description,
    });

    if depth >= MAX_SCHEMA_DEPTH {
        return;
    }

    match ty {
        FieldType::Object => {
            let Some(props) = node.get("properties").and_then(Value::as_object) else {
                return;
            };
            let child_required = required_set(node);
            for (child, child_node) in props {
                let is_required = child_required.contains(&child.as_str());
                walk(
                    &format!("{}.{}", path, child),
                    child,
                    child_node,
                    components,
                    is_required,
                    path_required && is_required,
                    depth + 1,
                    out,
                );
            }
        }
        FieldType::Array => {
            let Some(items) = node.get("items") else {
                return;
            };
            let items = resolve(items, components, depth + 1);
            let Some(props) = items.get("properties").and_then(Value::as_object) else {
                return;
            };
            let child_required = required_set(items);
            for (child, child_node) in props {
                walk(
                    &format!("{}[].{}", path, child),
                    child,
                    child_node,
                    components,
                    child_required.contains(&child.as_str()),
                    false,
                    depth + 1,
                    out,
                );
            }
        }
        _ => {}
    }
}

/// Source of resource schemas (the live cluster in production).
///
/// `Ok(None)` means the resource type is unknown. Malformed responses
/// must be reported as `Ok(None)` or `Err`; callers treat both as
/// "schema unavailable".
#[async_trait]
pub trait ClusterIntrospection: Send + Sync {
    async fn get_schema(&self, id: &ResourceIdentifier) -> Result<Option<SchemaDocument>>;
}

/// Fixed set of schemas, for tests and offline evaluation.
#[derive(Debug, Default)]
pub struct StaticSchemas {
    schemas: HashMap<ResourceIdentifier, SchemaDocument>,
}

impl StaticSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, doc: SchemaDocument) {
        self.schemas.insert(doc.id.clone(), doc);
    }

    pub fn with(mut self, doc: SchemaDocument) -> Self {
        self.insert(doc);
        self
    }
}

#[async_trait]
impl ClusterIntrospection for StaticSchemas {
    async fn get_schema(&self, id: &ResourceIdentifier) -> Result<Option<SchemaDocument>> {
        Ok(self.schemas.get(id).cloned())
    }
}
