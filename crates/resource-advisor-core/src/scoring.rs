//! Pass 1 score adjustment and final ordering.
//!
//! # Pass 1 score
//!
//! 1. Start from the reasoning service's ranking score (or the draft score
//!    when ranking was skipped).
//! 2. Blend with semantic fit: `(1 - w) × base + w × 100 × similarity`,
//!    where similarity is the mean capability-hit score of the members.
//! 3. Add the tier bonus of the best member tier, capped at `max_tier_bonus`.
//! 4. Subtract the completeness penalty: per injected dependency (capped)
//!    plus per member whose schema was unavailable.
//! 5. Clamp to `[0, 100]`.
//!
//! # Final order
//!
//! Score descending, then best tier (composite first), then resource count
//! ascending. The sort is stable, so remaining ties keep selection order.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::hierarchy::HierarchyTier;
use crate::models::{clamp_score, CandidateSolution, ResourceIdentifier};

/// Tunable Pass 1 weights (`[scoring]` config section).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_composite_bonus")]
    pub composite_bonus: f64,
    #[serde(default = "default_operator_bonus")]
    pub operator_bonus: f64,
    #[serde(default = "default_max_tier_bonus")]
    pub max_tier_bonus: f64,
    #[serde(default = "default_injected_penalty")]
    pub injected_dependency_penalty: f64,
    #[serde(default = "default_max_injected_penalty")]
    pub max_injected_penalty: f64,
    #[serde(default = "default_unresolved_penalty")]
    pub unresolved_schema_penalty: f64,
}

fn default_semantic_weight() -> f64 {
    0.2
}
fn default_composite_bonus() -> f64 {
    6.0
}
fn default_operator_bonus() -> f64 {
    2.0
}
fn default_max_tier_bonus() -> f64 {
    8.0
}
fn default_injected_penalty() -> f64 {
    2.0
}
fn default_max_injected_penalty() -> f64 {
    10.0
}
fn default_unresolved_penalty() -> f64 {
    1.0
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            composite_bonus: default_composite_bonus(),
            operator_bonus: default_operator_bonus(),
            max_tier_bonus: default_max_tier_bonus(),
            injected_dependency_penalty: default_injected_penalty(),
            max_injected_penalty: default_max_injected_penalty(),
            unresolved_schema_penalty: default_unresolved_penalty(),
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.semantic_weight) {
            bail!("scoring.semantic_weight must be in [0.0, 1.0]");
        }
        let non_negative = [
            ("composite_bonus", self.composite_bonus),
            ("operator_bonus", self.operator_bonus),
            ("max_tier_bonus", self.max_tier_bonus),
            ("injected_dependency_penalty", self.injected_dependency_penalty),
            ("max_injected_penalty", self.max_injected_penalty),
            ("unresolved_schema_penalty", self.unresolved_schema_penalty),
        ];
        for (name, value) in non_negative {
            if value < 0.0 || !value.is_finite() {
                bail!("scoring.{} must be a finite value >= 0", name);
            }
        }
        Ok(())
    }

    fn tier_bonus(&self, tier: HierarchyTier) -> f64 {
        let bonus = match tier {
            HierarchyTier::Composite => self.composite_bonus,
            HierarchyTier::Operator => self.operator_bonus,
            HierarchyTier::Primitive => 0.0,
        };
        bonus.min(self.max_tier_bonus)
    }

    /// Final Pass 1 score for `solution`. See the module docs.
    pub fn pass1_score(
        &self,
        base: f64,
        similarity: Option<f32>,
        tier: HierarchyTier,
        solution: &CandidateSolution,
    ) -> f64 {
        let base = clamp_score(base);
        let blended = match similarity {
            Some(sim) => {
                let sim = (sim as f64).clamp(0.0, 1.0);
                (1.0 - self.semantic_weight) * base + self.semantic_weight * 100.0 * sim
            }
            None => base,
        };
        let injected = (solution.injected.len() as f64 * self.injected_dependency_penalty)
            .min(self.max_injected_penalty);
        let unresolved = solution.warnings.len() as f64 * self.unresolved_schema_penalty;
        clamp_score(blended + self.tier_bonus(tier) - injected - unresolved)
    }
}

/// Highest tier among the solution's members.
pub fn best_tier(solution: &CandidateSolution, tiers: &HashMap<ResourceIdentifier, HierarchyTier>) -> HierarchyTier {
    solution
        .resources
        .iter()
        .filter_map(|id| tiers.get(id).copied())
        .max()
        .unwrap_or(HierarchyTier::Primitive)
}

/// Mean similarity of members that appeared in the capability hits.
pub fn mean_similarity(solution: &CandidateSolution, similarity: &HashMap<ResourceIdentifier, f32>) -> Option<f32> {
    let scores: Vec<f32> = solution
        .resources
        .iter()
        .filter_map(|id| similarity.get(id).copied())
        .collect();
    if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f32>() / scores.len() as f32)
    }
}

/// Sort solutions into their final order.
pub fn rank_solutions(solutions: &mut [CandidateSolution], tiers: &HashMap<ResourceIdentifier, HierarchyTier>) {
    solutions.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| best_tier(b, tiers).cmp(&best_tier(a, tiers)))
            .then_with(|| a.resources.len().cmp(&b.resources.len()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(group: &str, kind: &str) -> ResourceIdentifier {
        ResourceIdentifier::new(group, "v1", kind)
    }

    #[test]
    fn test_semantic_blend() {
        let w = ScoringWeights {
            semantic_weight: 0.5,
            ..ScoringWeights::default()
        };
        let s = CandidateSolution::new("s", vec![id("apps", "Deployment")], 0.0);
        let score = w.pass1_score(80.0, Some(0.5), HierarchyTier::Primitive, &s);
        assert!((score - 65.0).abs() < 1e-9);
        assert_eq!(w.pass1_score(80.0, None, HierarchyTier::Primitive, &s), 80.0);
    }

    #[test]
    fn test_tier_bonus_is_bounded() {
        let w = ScoringWeights {
            composite_bonus: 50.0,
            max_tier_bonus: 5.0,
            ..ScoringWeights::default()
        };
        let s = CandidateSolution::new("s", vec![id("x.io", "App")], 0.0);
        assert_eq!(w.pass1_score(60.0, None, HierarchyTier::Composite, &s), 65.0);
    }

    #[test]
    fn test_completeness_penalty_capped() {
        let w = ScoringWeights::default();
        let mut s = CandidateSolution::new("s", vec![id("x.io", "A")], 0.0);
        s.injected = (0..20).map(|i| id("x.io", &format!("Dep{}", i))).collect();
        s.warnings = vec!["schema unavailable".into()];
        let score = w.pass1_score(50.0, None, HierarchyTier::Primitive, &s);
        assert_eq!(score, 50.0 - w.max_injected_penalty - w.unresolved_schema_penalty);
    }

    #[test]
    fn test_rank_tie_breaks() {
        let composite = id("platform.example.org", "App");
        let mut tiers = HashMap::new();
        tiers.insert(composite.clone(), HierarchyTier::Composite);

        let primitive_big = CandidateSolution::new("a", vec![id("apps", "Deployment"), id("", "Service")], 70.0);
        let primitive_small = CandidateSolution::new("b", vec![id("apps", "Deployment")], 70.0);
        let composite_sol = CandidateSolution::new("c", vec![composite, id("", "Service")], 70.0);
        let best = CandidateSolution::new("d", vec![id("apps", "StatefulSet")], 90.0);

        let mut all = vec![primitive_big, primitive_small, composite_sol, best];
        rank_solutions(&mut all, &tiers);
        let order: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["d", "c", "b", "a"], "primitive-only solution stays selectable when it scores highest");
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let w = ScoringWeights {
            semantic_weight: 1.5,
            ..ScoringWeights::default()
        };
        assert!(w.validate().is_err());
        let w = ScoringWeights {
            operator_bonus: -1.0,
            ..ScoringWeights::default()
        };
        assert!(w.validate().is_err());
        assert!(ScoringWeights::default().validate().is_ok());
    }
}
