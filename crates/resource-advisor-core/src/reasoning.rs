//! Reasoning-service interface and the validation boundary around it.
//!
//! Every response from the reasoning service is untrusted. The functions
//! here turn an untyped JSON payload into typed pipeline values, or reject
//! it:
//!
//! - [`parse_selection`] — `select` responses → fresh [`CandidateSolution`]s.
//! - [`parse_ranking`] — `rank` responses → per-solution scores and reasons.
//! - [`parse_enhancement`] + [`apply_enhancement`] — `enhance` responses,
//!   checked against the additive-only contract before they replace a
//!   Pass 1 solution.
//!
//! The matching request payloads are built by [`select_payload`],
//! [`rank_payload`] and [`enhance_payload`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::AdvisorError;
use crate::hierarchy::HierarchyTier;
use crate::models::{
    clamp_score, CandidateSolution, CapabilityRecord, Hit, PatternInfluence, PatternRecord,
    ResourceIdentifier,
};

/// Upper bound on candidates accepted from a `select` response.
pub const MAX_CANDIDATES: usize = 5;

const DEFAULT_DRAFT_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    Select,
    Rank,
    Enhance,
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PromptKind::Select => "select",
            PromptKind::Rank => "rank",
            PromptKind::Enhance => "enhance",
        })
    }
}

/// The natural-language reasoning collaborator.
///
/// `strict` is set on the single retry that follows a response which
/// failed validation; implementations should tighten their output
/// instructions accordingly.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn invoke(&self, kind: PromptKind, context: &Value, strict: bool) -> Result<Value>;
}

/// Extract the JSON object from free-form model output.
///
/// Tolerates Markdown code fences and prose around the object.
pub fn extract_json(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| anyhow!("response contains no JSON object"))?;
    let end = trimmed
        .rfind('}')
        .ok_or_else(|| anyhow!("response contains no JSON object"))?;
    if end < start {
        bail!("response contains no JSON object");
    }
    Ok(serde_json::from_str(&trimmed[start..=end])?)
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn solutions_array<'a>(resp: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    resp.get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("response is missing the '{}' array", key))
}

// ============ Payloads ============

pub fn select_payload(intent: &str, hits: &[Hit<CapabilityRecord>], max_solutions: usize) -> Value {
    let capabilities: Vec<Value> = hits
        .iter()
        .map(|h| {
            json!({
                "resource": h.record.id,
                "description": h.record.description,
                "capabilities": h.record.capability_tags,
                "providers": h.record.provider_tags,
                "complexity": h.record.complexity_tier,
                "similarity": h.score,
            })
        })
        .collect();
    json!({
        "intent": intent,
        "maxSolutions": max_solutions.clamp(1, MAX_CANDIDATES),
        "capabilities": capabilities,
    })
}

pub fn rank_payload(
    intent: &str,
    solutions: &[CandidateSolution],
    tiers: &HashMap<ResourceIdentifier, HierarchyTier>,
) -> Value {
    let items: Vec<Value> = solutions
        .iter()
        .map(|s| {
            let resources: Vec<Value> = s
                .resources
                .iter()
                .map(|id| {
                    json!({
                        "resource": id,
                        "tier": tiers.get(id).copied().unwrap_or(HierarchyTier::Primitive),
                        "injected": s.injected.contains(id),
                    })
                })
                .collect();
            json!({
                "id": s.id,
                "draftScore": s.score,
                "resources": resources,
                "previouslyIncomplete": s.previously_incomplete,
                "warnings": s.warnings,
            })
        })
        .collect();
    json!({ "intent": intent, "solutions": items })
}

pub fn enhance_payload(intent: &str, solutions: &[CandidateSolution], patterns: &[Hit<PatternRecord>]) -> Value {
    let items: Vec<Value> = solutions
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "resources": s.resources,
                "score": s.score,
                "reasons": s.reasons,
            })
        })
        .collect();
    let patterns: Vec<Value> = patterns
        .iter()
        .map(|h| {
            json!({
                "id": h.record.id,
                "description": h.record.trigger_description,
                "suggestedResources": h.record.suggested_resources,
                "rationale": h.record.rationale,
                "similarity": h.score,
            })
        })
        .collect();
    json!({
        "intent": intent,
        "solutions": items,
        "patterns": patterns,
        "contract": "Only append resources listed in a matched pattern's suggestedResources. Never remove or reorder existing resources.",
    })
}

// ============ Selection ============

/// Validated output of a `select` response.
#[derive(Debug, Clone)]
pub struct Selection {
    pub solutions: Vec<CandidateSolution>,
    /// Coercions applied while validating (dropped resources and the like).
    pub warnings: Vec<String>,
}

/// Validate a `select` response.
///
/// Resources outside `known` are dropped (when `known` is non-empty),
/// duplicate resources and duplicate solutions are removed, and scores are
/// clamped. Fails when no usable solution remains.
pub fn parse_selection(resp: &Value, known: &HashSet<ResourceIdentifier>, max_solutions: usize) -> Result<Selection> {
    let raw = solutions_array(resp, "solutions")?;
    let limit = max_solutions.clamp(1, MAX_CANDIDATES);
    let mut solutions: Vec<CandidateSolution> = Vec::new();
    let mut warnings = Vec::new();

    for (i, item) in raw.iter().enumerate() {
        let Some(resources) = item.get("resources").and_then(Value::as_array) else {
            warnings.push(format!("solution #{} has no resources array", i + 1));
            continue;
        };
        let mut ids: Vec<ResourceIdentifier> = Vec::new();
        for value in resources {
            match ResourceIdentifier::from_value(value) {
                Ok(id) if !known.is_empty() && !known.contains(&id) => {
                    warnings.push(format!("dropped unknown resource {}", id));
                }
                Ok(id) => {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Err(e) => warnings.push(format!("dropped malformed resource: {}", e)),
            }
        }
        if ids.is_empty() {
            continue;
        }
        let duplicate = solutions.iter().any(|s| {
            s.resources.len() == ids.len() && ids.iter().all(|id| s.resources.contains(id))
        });
        if duplicate {
            continue;
        }

        let score = number(item.get("score")).unwrap_or(DEFAULT_DRAFT_SCORE);
        let mut solution = CandidateSolution::new(format!("solution-{}", solutions.len() + 1), ids, score);
        solution.reasons = strings(item.get("reasons").or_else(|| item.get("reason")));
        solutions.push(solution);
        if solutions.len() == limit {
            break;
        }
    }

    if solutions.is_empty() {
        bail!("response contained no usable solutions");
    }
    Ok(Selection { solutions, warnings })
}

// ============ Ranking ============

#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub score: f64,
    pub reasons: Vec<String>,
}

/// Validate a `rank` response into per-solution rankings.
///
/// Entries for unknown solution ids or without a numeric score are
/// ignored; a missing `rankings` array is an error.
pub fn parse_ranking(resp: &Value, solution_ids: &[&str]) -> Result<HashMap<String, Ranking>> {
    let raw = solutions_array(resp, "rankings").or_else(|_| solutions_array(resp, "solutions"))?;
    let mut rankings = HashMap::new();
    for item in raw {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        if !solution_ids.contains(&id) {
            continue;
        }
        let Some(score) = number(item.get("score")) else {
            continue;
        };
        rankings.insert(
            id.to_string(),
            Ranking {
                score: clamp_score(score),
                reasons: strings(item.get("reasons").or_else(|| item.get("reason"))),
            },
        );
    }
    Ok(rankings)
}

// ============ Enhancement ============

/// One solution as proposed by an `enhance` response, before the contract
/// check.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedSolution {
    pub id: String,
    pub resources: Vec<ResourceIdentifier>,
    pub score: Option<f64>,
    pub reasons: Vec<String>,
    pub pattern_id: Option<String>,
}

/// Validate the shape of an `enhance` response.
///
/// Returns one entry per solution id. An entry is `Err` when that
/// solution's resources could not be decoded; the caller reverts it.
pub fn parse_enhancement(resp: &Value) -> Result<HashMap<String, Result<ProposedSolution, String>>> {
    let raw = solutions_array(resp, "solutions")?;
    let mut proposals = HashMap::new();
    for item in raw {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        let proposal = item
            .get("resources")
            .and_then(Value::as_array)
            .ok_or_else(|| "resources array missing".to_string())
            .and_then(|values| {
                values
                    .iter()
                    .map(|v| ResourceIdentifier::from_value(v).map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, String>>()
            })
            .map(|resources| ProposedSolution {
                id: id.to_string(),
                resources,
                score: number(item.get("score")),
                reasons: strings(item.get("reasons").or_else(|| item.get("reason"))),
                pattern_id: item
                    .get("patternInfluence")
                    .and_then(|p| p.get("patternId"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        proposals.insert(id.to_string(), proposal);
    }
    Ok(proposals)
}

/// Check a proposal against the additive-only contract and merge it.
///
/// The proposal must keep every Pass 1 resource in its original order as a
/// prefix, and may only append resources suggested by one of `patterns`.
/// Appended resources whose group and kind are already present are
/// skipped. A proposal that adds nothing leaves the solution untouched.
///
/// The score is left as is: `proposal.score` is a raw reasoning score and
/// the caller rescores it on the Pass 1 scale.
pub fn apply_enhancement(
    original: &CandidateSolution,
    proposal: &ProposedSolution,
    patterns: &[Hit<PatternRecord>],
) -> Result<CandidateSolution, AdvisorError> {
    let violation = |reason: String| AdvisorError::ContractViolation {
        solution: original.id.clone(),
        reason,
    };

    let n = original.resources.len();
    if proposal.resources.len() < n || proposal.resources[..n] != original.resources[..] {
        let removed: Vec<String> = original
            .resources
            .iter()
            .filter(|id| !proposal.resources.contains(id))
            .map(|id| id.to_string())
            .collect();
        return Err(violation(if removed.is_empty() {
            "existing resources were reordered".to_string()
        } else {
            format!("removed {}", removed.join(", "))
        }));
    }

    // Another version of a kind already present adds nothing.
    let mut appended: Vec<ResourceIdentifier> = Vec::new();
    for id in &proposal.resources[n..] {
        if original.contains_kind(id) || appended.iter().any(|a| a.same_kind(id)) {
            tracing::debug!(solution = %original.id, resource = %id, "skipping redundant addition");
            continue;
        }
        if !patterns.iter().any(|p| p.record.suggested_resources.contains(id)) {
            return Err(violation(format!("{} is not suggested by any matched pattern", id)));
        }
        appended.push(id.clone());
    }
    if appended.is_empty() {
        return Ok(original.clone());
    }

    let suggests_addition = |p: &&Hit<PatternRecord>| {
        appended
            .iter()
            .any(|id| p.record.suggested_resources.contains(id))
    };
    let pattern_id = proposal
        .pattern_id
        .as_deref()
        .and_then(|pid| patterns.iter().filter(suggests_addition).find(|p| p.record.id == pid))
        .or_else(|| {
            patterns
                .iter()
                .find(|p| p.record.suggested_resources.contains(&appended[0]))
        })
        .map(|p| p.record.id.clone())
        .ok_or_else(|| violation("no matched pattern explains the additions".to_string()))?;

    let mut enhanced = original.clone();
    enhanced.resources.extend(appended.iter().cloned());
    for reason in &proposal.reasons {
        if !enhanced.reasons.contains(reason) {
            enhanced.reasons.push(reason.clone());
        }
    }
    let added: Vec<String> = appended.iter().map(|id| id.to_string()).collect();
    enhanced
        .reasons
        .push(format!("Added {} per pattern '{}'", added.join(", "), pattern_id));
    enhanced.pattern_influence = Some(PatternInfluence {
        pattern_id,
        added_resources: appended,
    });
    Ok(enhanced)
}
