//! Schema-driven dependency discovery.
//!
//! The [`DependencyResolver`] fetches a resource's schema through
//! [`ClusterIntrospection`] and matches every flattened field against a
//! rule table. A rule names a field-name regex (optionally capturing the
//! referenced kind as `kind`), the value shape it applies to, and where the
//! target kind comes from. Rules are plain data ([`RefRule`]); deployments
//! add provider conventions through configuration instead of code.
//!
//! # Edge strength
//!
//! | Field | Edge |
//! |-------|------|
//! | required at every level below `spec` | [`EdgeKind::Foundation`] |
//! | required, under an optional parent | [`EdgeKind::Reference`] |
//! | optional | [`EdgeKind::Optional`] |
//!
//! A referenced kind name becomes a full identifier through the request's
//! [`KindCatalog`]: same group as the dependent first, then the same
//! provider domain, then the core group, then a unique match anywhere.
//! When several versions of a kind are served, the highest by Kubernetes
//! version priority wins. Unknown kinds produce no edge.
//!
//! A foundation is satisfied by any version of its group and kind already
//! in the solution.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::error::AdvisorError;
use crate::models::{CandidateSolution, DependencyEdge, EdgeKind, ResourceIdentifier, VersionPriority};
use crate::schema::{ClusterIntrospection, FieldType, SchemaDocument, SchemaField};

/// Value shape a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeMatch {
    #[default]
    Any,
    String,
    Object,
}

/// One row of the reference-convention table.
#[derive(Debug, Clone, Deserialize)]
pub struct RefRule {
    pub name: String,
    /// Regex over the field name. A `kind` capture names the target kind.
    pub field_pattern: String,
    #[serde(default)]
    pub shape: ShapeMatch,
    /// Fixed target kind, used when the pattern has no `kind` capture.
    #[serde(default)]
    pub target_kind: Option<String>,
    /// Restrict the target to this API group.
    #[serde(default)]
    pub target_group: Option<String>,
    /// Read `group/Kind` out of the field description
    /// ("... a reference to a resources.azure.com/ResourceGroup resource").
    #[serde(default)]
    pub kind_from_description: bool,
}

impl RefRule {
    /// Check that `field_pattern` compiles.
    pub fn validate(&self) -> Result<()> {
        Regex::new(&self.field_pattern)
            .with_context(|| format!("invalid field_pattern in rule '{}'", self.name))?;
        Ok(())
    }
}

const BUILTIN_RULES: &[(&str, &str, ShapeMatch, bool)] = &[
    ("owner-reference", r"^owner$", ShapeMatch::Object, true),
    ("kind-ref", r"^(?P<kind>[a-z][A-Za-z0-9]*?)(Name|Id)?Ref$", ShapeMatch::Any, false),
    ("kind-selector", r"^(?P<kind>[a-z][A-Za-z0-9]*?)(Name|Id)?Selector$", ShapeMatch::Object, false),
    ("kind-name", r"^(?P<kind>[a-z][A-Za-z0-9]*?)Name$", ShapeMatch::String, false),
];

/// The built-in reference conventions.
pub fn default_rules() -> Vec<RefRule> {
    BUILTIN_RULES
        .iter()
        .map(|(name, pattern, shape, from_desc)| RefRule {
            name: name.to_string(),
            field_pattern: pattern.to_string(),
            shape: *shape,
            target_kind: None,
            target_group: None,
            kind_from_description: *from_desc,
        })
        .collect()
}

struct CompiledRule {
    rule: RefRule,
    regex: Regex,
}

/// Read-only snapshot of resource identifiers known for one request.
#[derive(Debug, Clone, Default)]
pub struct KindCatalog {
    ids: Vec<ResourceIdentifier>,
}

impl KindCatalog {
    pub fn new(mut ids: Vec<ResourceIdentifier>) -> Self {
        ids.sort();
        ids.dedup();
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &ResourceIdentifier) -> bool {
        self.ids.binary_search(id).is_ok()
    }

    pub fn ids(&self) -> &[ResourceIdentifier] {
        &self.ids
    }

    /// Resolve a kind name referenced from `from` into a known identifier.
    pub fn lookup(
        &self,
        kind: &str,
        group: Option<&str>,
        from: &ResourceIdentifier,
    ) -> Option<ResourceIdentifier> {
        let matches: Vec<&ResourceIdentifier> = self
            .ids
            .iter()
            .filter(|id| id.kind.eq_ignore_ascii_case(kind))
            .filter(|id| group.map(|g| id.group == g).unwrap_or(true))
            .collect();
        if matches.is_empty() {
            return None;
        }

        let latest = |pred: &dyn Fn(&ResourceIdentifier) -> bool| {
            matches
                .iter()
                .filter(|id| pred(id))
                .max_by_key(|id| VersionPriority::of(&id.version))
                .map(|id| (*id).clone())
        };

        latest(&|id| id.group == from.group)
            .or_else(|| {
                latest(&|id| !from.is_core_group() && id.provider_domain() == from.provider_domain())
            })
            .or_else(|| latest(&|id| id.is_core_group()))
            .or_else(|| {
                let groups: Vec<&str> = matches.iter().map(|id| id.group.as_str()).collect();
                if groups.iter().all(|g| *g == groups[0]) {
                    latest(&|_| true)
                } else {
                    None
                }
            })
    }
}

/// Dependencies discovered for one identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub edges: Vec<DependencyEdge>,
    /// Set when the schema could not be fetched or parsed.
    pub warning: Option<String>,
}

impl Resolution {
    pub fn unavailable(id: &ResourceIdentifier, reason: impl Into<String>) -> Self {
        let warning = AdvisorError::SchemaUnavailable {
            id: id.clone(),
            reason: reason.into(),
        };
        Self {
            edges: Vec::new(),
            warning: Some(warning.to_string()),
        }
    }

    pub fn foundations(&self) -> impl Iterator<Item = &ResourceIdentifier> {
        self.edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Foundation)
            .map(|e| &e.requires)
    }
}

/// Per-request memo of resolved identifiers.
pub type DependencyMap = HashMap<ResourceIdentifier, Resolution>;

/// Extracts [`DependencyEdge`]s from resource schemas.
pub struct DependencyResolver {
    introspection: Arc<dyn ClusterIntrospection>,
    rules: Vec<CompiledRule>,
    description_ref: Regex,
}

impl DependencyResolver {
    /// Build a resolver with the built-in rules followed by `extra_rules`.
    pub fn new(introspection: Arc<dyn ClusterIntrospection>, extra_rules: Vec<RefRule>) -> Result<Self> {
        let rules = default_rules()
            .into_iter()
            .chain(extra_rules)
            .map(|rule| {
                let regex = Regex::new(&rule.field_pattern)
                    .with_context(|| format!("invalid field_pattern in rule '{}'", rule.name))?;
                Ok(CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>>>()?;
        let description_ref = Regex::new(r"(?P<group>[a-z0-9][a-z0-9.-]*\.[a-z]+)/(?P<kind>[A-Z][A-Za-z0-9]*)")?;
        Ok(Self {
            introspection,
            rules,
            description_ref,
        })
    }

    /// Fetch the schema for `id` and extract its edges.
    ///
    /// Never fails: an unavailable or malformed schema yields zero edges and
    /// a warning.
    pub async fn resolve(&self, id: &ResourceIdentifier, catalog: &KindCatalog) -> Resolution {
        match self.introspection.get_schema(id).await {
            Ok(Some(doc)) => Resolution {
                edges: self.edges_from_schema(&doc, catalog),
                warning: None,
            },
            Ok(None) => {
                tracing::warn!(resource = %id, "schema not found");
                Resolution::unavailable(id, "not found")
            }
            Err(e) => {
                tracing::warn!(resource = %id, error = %e, "schema fetch failed");
                Resolution::unavailable(id, e.to_string())
            }
        }
    }

    /// Apply the rule table to every field of `doc`.
    pub fn edges_from_schema(&self, doc: &SchemaDocument, catalog: &KindCatalog) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = Vec::new();
        for field in &doc.fields {
            let Some(requires) = self.match_field(field, &doc.id, catalog) else {
                continue;
            };
            if requires == doc.id {
                continue;
            }
            let kind = edge_kind(field);
            match edges.iter_mut().find(|e| e.requires == requires) {
                Some(existing) => {
                    if strength(kind) > strength(existing.kind) {
                        existing.kind = kind;
                        existing.via = field.path.clone();
                    }
                }
                None => edges.push(DependencyEdge {
                    dependent: doc.id.clone(),
                    requires,
                    kind,
                    via: field.path.clone(),
                }),
            }
        }
        edges
    }

    fn match_field(
        &self,
        field: &SchemaField,
        from: &ResourceIdentifier,
        catalog: &KindCatalog,
    ) -> Option<ResourceIdentifier> {
        for compiled in &self.rules {
            let rule = &compiled.rule;
            if !shape_matches(rule.shape, field.field_type) {
                continue;
            }
            let Some(caps) = compiled.regex.captures(&field.name) else {
                continue;
            };

            let mut group = rule.target_group.clone();
            let mut kind = caps
                .name("kind")
                .map(|m| upper_first(m.as_str()))
                .or_else(|| rule.target_kind.clone());

            if rule.kind_from_description {
                if let Some(desc) = field.description.as_deref() {
                    if let Some(found) = self.description_ref.captures(desc) {
                        group = Some(found["group"].to_string());
                        kind = Some(found["kind"].to_string());
                    }
                }
            }

            let Some(kind) = kind else {
                continue;
            };
            if let Some(target) = catalog.lookup(&kind, group.as_deref(), from) {
                return Some(target);
            }
        }
        None
    }
}

fn shape_matches(shape: ShapeMatch, ty: FieldType) -> bool {
    match shape {
        ShapeMatch::Any => matches!(ty, FieldType::String | FieldType::Object),
        ShapeMatch::String => ty == FieldType::String,
        ShapeMatch::Object => ty == FieldType::Object,
    }
}

fn edge_kind(field: &SchemaField) -> EdgeKind {
    if field.path_required {
        EdgeKind::Foundation
    } else if field.required {
        EdgeKind::Reference
    } else {
        EdgeKind::Optional
    }
}

fn strength(kind: EdgeKind) -> u8 {
    match kind {
        EdgeKind::Foundation => 2,
        EdgeKind::Reference => 1,
        EdgeKind::Optional => 0,
    }
}

fn upper_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Members of `solution` not yet present in `map`.
pub fn unresolved(solution: &CandidateSolution, map: &DependencyMap) -> Vec<ResourceIdentifier> {
    solution
        .resources
        .iter()
        .filter(|id| !map.contains_key(*id))
        .cloned()
        .collect()
}

/// Append every missing foundation target to `solution`.
///
/// Targets are appended after the existing members in discovery order,
/// tagged as injected, and schema warnings are attached once. Returns the
/// injected identifiers. Call repeatedly (after resolving the injected
/// members) to reach the transitive closure.
pub fn inject_foundations(solution: &mut CandidateSolution, map: &DependencyMap) -> Vec<ResourceIdentifier> {
    let mut missing: Vec<(ResourceIdentifier, ResourceIdentifier)> = Vec::new();
    for member in &solution.resources {
        let Some(resolution) = map.get(member) else {
            continue;
        };
        if let Some(warning) = &resolution.warning {
            if !solution.warnings.contains(warning) {
                solution.warnings.push(warning.clone());
            }
        }
        for target in resolution.foundations() {
            if !solution.contains_kind(target) && !missing.iter().any(|(t, _)| t.same_kind(target)) {
                missing.push((target.clone(), member.clone()));
            }
        }
    }

    let mut injected = Vec::with_capacity(missing.len());
    for (target, dependent) in missing {
        if solution.push_unique(target.clone()) {
            solution
                .reasons
                .push(format!("Added {} (required by {})", target, dependent));
            solution.injected.push(target.clone());
            injected.push(target);
        }
    }
    injected
}

/// Whether every foundation target of every resolved member is present.
pub fn is_complete(solution: &CandidateSolution, map: &DependencyMap) -> bool {
    solution.resources.iter().all(|member| {
        map.get(member)
            .map(|r| r.foundations().all(|t| solution.contains_kind(t)))
            .unwrap_or(true)
    })
}
