//! Resource hierarchy tiers.
//!
//! Classifies a resource type as composite (an organization's high-level
//! abstraction), operator-managed (a third-party controller's API), or
//! primitive (built-in building block). Rules are evaluated in that order;
//! the first match wins. Tiers only break ties between equally scored
//! solutions and never filter anything out.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::models::ResourceIdentifier;

/// Abstraction tier. Ordered so that `Composite` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HierarchyTier {
    Primitive,
    Operator,
    Composite,
}

/// Classification markers, usually loaded from the `[hierarchy]` config
/// section.
#[derive(Debug, Clone, Deserialize)]
pub struct HierarchyRules {
    /// Globs over API groups owned by the organization.
    #[serde(default)]
    pub composite_groups: Vec<String>,
    /// Kind prefixes marking composites (`X` matches `XPostgres`, not `Xml`).
    #[serde(default)]
    pub composite_kind_prefixes: Vec<String>,
    /// Capability tags marking composites.
    #[serde(default = "default_composite_tags")]
    pub composite_tags: Vec<String>,
    /// Globs over third-party operator API groups.
    #[serde(default = "default_operator_groups")]
    pub operator_groups: Vec<String>,
}

fn default_composite_tags() -> Vec<String> {
    vec!["composite".to_string()]
}

fn default_operator_groups() -> Vec<String> {
    [
        "*.azure.com",
        "*.upbound.io",
        "*.crossplane.io",
        "*.cnpg.io",
        "cert-manager.io",
        "*.cert-manager.io",
        "*.k8s.aws",
        "*.cnrm.cloud.google.com",
        "*.istio.io",
        "*.strimzi.io",
        "*.knative.dev",
        "argoproj.io",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for HierarchyRules {
    fn default() -> Self {
        Self {
            composite_groups: Vec::new(),
            composite_kind_prefixes: Vec::new(),
            composite_tags: default_composite_tags(),
            operator_groups: default_operator_groups(),
        }
    }
}

pub struct Hierarchizer {
    composite_groups: GlobSet,
    composite_kind_prefixes: Vec<String>,
    composite_tags: Vec<String>,
    operator_groups: GlobSet,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid group glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

impl Hierarchizer {
    pub fn new(rules: &HierarchyRules) -> Result<Self> {
        Ok(Self {
            composite_groups: build_globset(&rules.composite_groups)?,
            composite_kind_prefixes: rules.composite_kind_prefixes.clone(),
            composite_tags: rules
                .composite_tags
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
            operator_groups: build_globset(&rules.operator_groups)?,
        })
    }

    /// Classify by identity alone.
    pub fn tier(&self, id: &ResourceIdentifier) -> HierarchyTier {
        self.tier_with_tags(id, None)
    }

    /// Classify using identity plus the capability tags indexed for `id`.
    pub fn tier_with_tags(&self, id: &ResourceIdentifier, tags: Option<&BTreeSet<String>>) -> HierarchyTier {
        if self.is_composite(id, tags) {
            HierarchyTier::Composite
        } else if !id.group.is_empty() && self.operator_groups.is_match(&id.group) {
            HierarchyTier::Operator
        } else {
            HierarchyTier::Primitive
        }
    }

    fn is_composite(&self, id: &ResourceIdentifier, tags: Option<&BTreeSet<String>>) -> bool {
        if !id.group.is_empty() && self.composite_groups.is_match(&id.group) {
            return true;
        }
        let prefixed = self.composite_kind_prefixes.iter().any(|prefix| {
            id.kind
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.chars().next())
                .map(|c| c.is_ascii_uppercase())
                .unwrap_or(false)
        });
        if prefixed {
            return true;
        }
        tags.map(|tags| {
            tags.iter()
                .any(|t| self.composite_tags.contains(&t.to_lowercase()))
        })
        .unwrap_or(false)
    }
}
