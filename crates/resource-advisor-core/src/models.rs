//! Core data models used throughout Resource Advisor.
//!
//! These types represent the resource identities, indexed records, dependency
//! edges, and candidate solutions that flow through the recommendation
//! pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cluster resource type: `(group, version, kind)`.
///
/// The empty group is the core API group (`Pod`, `Service`, ...). The
/// canonical text form is `Kind.group/version`, or `Kind/version` for the
/// core group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceIdentifier {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build an identifier from a manifest-style `apiVersion` and `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self> {
        let (group, version) = match api_version.rsplit_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let id = Self::new(group, version, kind);
        id.validate()?;
        Ok(id)
    }

    /// The `apiVersion` string as it appears in a manifest.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn is_core_group(&self) -> bool {
        self.group.is_empty()
    }

    /// Same group and kind, any version.
    pub fn same_kind(&self, other: &ResourceIdentifier) -> bool {
        self.group == other.group && self.kind == other.kind
    }

    /// Provider domain of the group: the last two dot-separated labels
    /// (`dbforpostgresql.azure.com` → `azure.com`).
    pub fn provider_domain(&self) -> &str {
        let mut dots = self.group.rmatch_indices('.');
        match (dots.next(), dots.next()) {
            (Some(_), Some((idx, _))) => &self.group[idx + 1..],
            _ => &self.group,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            bail!("resource identifier has an empty kind");
        }
        if self.version.trim().is_empty() {
            bail!("resource identifier '{}' has an empty version", self.kind);
        }
        if self
            .kind
            .chars()
            .any(|c| !c.is_ascii_alphanumeric())
        {
            bail!("invalid kind '{}'", self.kind);
        }
        Ok(())
    }

    /// Coerce an untyped JSON value into an identifier.
    ///
    /// Accepts `{group, version, kind}`, `{apiVersion, kind}`, or the
    /// canonical string form.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => s.parse(),
            Value::Object(map) => {
                let kind = map
                    .get("kind")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("resource is missing 'kind'"))?;
                if let Some(api_version) = map.get("apiVersion").and_then(Value::as_str) {
                    return Self::from_api_version(api_version, kind);
                }
                let version = map
                    .get("version")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("resource '{}' is missing 'version'", kind))?;
                let group = map.get("group").and_then(Value::as_str).unwrap_or("");
                let id = Self::new(group, version, kind);
                id.validate()?;
                Ok(id)
            }
            other => bail!("expected a resource identifier, got {}", other),
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.kind, self.version)
        } else {
            write!(f, "{}.{}/{}", self.kind, self.group, self.version)
        }
    }
}

/// Ordering key for an API version, highest priority greatest.
///
/// Follows Kubernetes version priority: stable above beta above alpha, then
/// the higher major version, then the higher qualifier number (`v2` beats
/// `v1`, `v10` beats `v2`, `v1beta2` beats `v1beta1`). A qualifier other
/// than alpha or beta, such as ASO's `v1api20200601`, counts as stable and
/// is ordered by its trailing number. Strings not of the form `v<major>...`
/// rank below every well-formed version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionPriority {
    well_formed: bool,
    track: u8,
    major: u64,
    number: u64,
    raw: String,
}

impl VersionPriority {
    pub fn of(version: &str) -> Self {
        let mut key = Self {
            well_formed: false,
            track: 0,
            major: 0,
            number: 0,
            raw: version.to_string(),
        };
        let Some(rest) = version.strip_prefix('v') else {
            return key;
        };
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        let Ok(major) = rest[..digits].parse::<u64>() else {
            return key;
        };
        let qualifier = &rest[digits..];
        let (track, number) = if let Some(n) = qualifier.strip_prefix("alpha") {
            (0, n)
        } else if let Some(n) = qualifier.strip_prefix("beta") {
            (1, n)
        } else {
            (2, qualifier.trim_start_matches(|c: char| c.is_ascii_alphabetic()))
        };
        key.well_formed = true;
        key.track = track;
        key.major = major;
        key.number = number.parse().unwrap_or(0);
        key
    }
}

impl FromStr for ResourceIdentifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (head, version) = s
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| anyhow::anyhow!("'{}' is not of the form Kind.group/version", s))?;
        let (kind, group) = match head.split_once('.') {
            Some((k, g)) => (k, g),
            None => (head, ""),
        };
        let id = Self::new(group, version, kind);
        id.validate()?;
        Ok(id)
    }
}

/// Relative complexity of using a resource type directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Low,
    Medium,
    High,
}

/// Semantic description of one cluster resource type.
///
/// Written by the cluster sync process; read-only to the recommendation
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    pub id: ResourceIdentifier,
    pub description: String,
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    #[serde(default)]
    pub provider_tags: BTreeSet<String>,
    pub complexity_tier: ComplexityTier,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
}

/// An organizational rule: intents resembling `trigger_description` should
/// include `suggested_resources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternRecord {
    pub id: String,
    pub trigger_description: String,
    pub suggested_resources: Vec<ResourceIdentifier>,
    pub rationale: String,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
}

/// A retrieval hit with similarity in `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hit<T> {
    pub record: T,
    pub score: f32,
}

/// Strength of a dependency discovered from a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Required for the dependent to provision at all.
    Foundation,
    /// Referenced by a required field nested under an optional parent.
    Reference,
    /// Referenced by an optional field.
    Optional,
}

/// `dependent` requires `requires`. Derived per request, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DependencyEdge {
    pub dependent: ResourceIdentifier,
    pub requires: ResourceIdentifier,
    pub kind: EdgeKind,
    /// Schema field path the edge was inferred from (e.g. `spec.owner`).
    pub via: String,
}

/// Records which pattern caused resources to be added during enhancement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternInfluence {
    pub pattern_id: String,
    pub added_resources: Vec<ResourceIdentifier>,
}

/// One proposed answer to an intent.
///
/// Created by Pass 1. Pass 2 may only append to `resources` and update
/// `score`, `reasons` and `pattern_influence`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSolution {
    pub id: String,
    pub resources: Vec<ResourceIdentifier>,
    /// Score in `[0.0, 100.0]`.
    pub score: f64,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_influence: Option<PatternInfluence>,
    /// Resources appended because a member's schema requires them.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub injected: Vec<ResourceIdentifier>,
    /// Non-fatal annotations (unavailable schemas and the like).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// The selection left out at least one foundation dependency.
    pub previously_incomplete: bool,
}

impl CandidateSolution {
    pub fn new(id: impl Into<String>, resources: Vec<ResourceIdentifier>, score: f64) -> Self {
        Self {
            id: id.into(),
            resources,
            score: clamp_score(score),
            reasons: Vec::new(),
            pattern_influence: None,
            injected: Vec::new(),
            warnings: Vec::new(),
            previously_incomplete: false,
        }
    }

    pub fn contains(&self, id: &ResourceIdentifier) -> bool {
        self.resources.contains(id)
    }

    /// Whether any version of `id`'s group and kind is a member.
    pub fn contains_kind(&self, id: &ResourceIdentifier) -> bool {
        self.resources.iter().any(|r| r.same_kind(id))
    }

    /// Append a resource unless it is already present. Returns whether it
    /// was added.
    pub fn push_unique(&mut self, id: ResourceIdentifier) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.resources.push(id);
        true
    }
}

/// Clamp a score into `[0.0, 100.0]`, mapping NaN to `0.0`.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}
