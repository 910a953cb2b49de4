//! The two-pass recommendation state machine.
//!
//! ```text
//! Idle → RetrievingCapabilities → SelectingCandidates → ResolvingDependencies
//!      → RankingPass1 → RetrievingPatterns → EnhancingPass2 → Done
//! ```
//!
//! `Error` is entered from any state on an unrecoverable condition: an
//! invalid request, a selection response that fails validation twice, or
//! the request deadline expiring before dependency resolution completed.
//! Everything later degrades instead: the best completed stage output is
//! returned with `degraded = true` and a note explaining why.
//!
//! Capability retrieval, pattern retrieval and the kind-catalog snapshot
//! run concurrently at the start of the request. The pattern hits are held
//! until `RetrievingPatterns`. Dependency resolution fans out per resource
//! and is joined before the state advances.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use resource_advisor_core::dependencies::{
    inject_foundations, is_complete, unresolved, DependencyMap, DependencyResolver, KindCatalog,
    Resolution,
};
use resource_advisor_core::embedding::EmbeddingProvider;
use resource_advisor_core::error::{AdvisorError, AdvisorResult, Stage};
use resource_advisor_core::hierarchy::{Hierarchizer, HierarchyTier};
use resource_advisor_core::index::VectorIndex;
use resource_advisor_core::models::{CandidateSolution, ResourceIdentifier};
use resource_advisor_core::reasoning::{
    apply_enhancement, enhance_payload, parse_enhancement, parse_ranking, parse_selection,
    rank_payload, select_payload, PromptKind, ReasoningService, MAX_CANDIDATES,
};
use resource_advisor_core::schema::ClusterIntrospection;
use resource_advisor_core::scoring::{best_tier, mean_similarity, rank_solutions, ScoringWeights};
use resource_advisor_core::stores::{CapabilityStore, PatternStore, Retrieval};

use crate::config::Config;

/// The external services the advisor talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub index: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub introspection: Arc<dyn ClusterIntrospection>,
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RecommendOptions {
    /// Number of solutions to return, `1..=5`. Defaults to
    /// `recommend.max_solutions`.
    pub max_solutions: Option<usize>,
}

/// Result of one `recommend` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub solutions: Vec<CandidateSolution>,
    /// Some stage could not run to completion.
    pub degraded: bool,
    /// Why `degraded` is set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
struct Limits {
    capability_limit: usize,
    pattern_limit: usize,
    catalog_limit: usize,
    max_solutions: usize,
    request_deadline: Duration,
    call_timeout: Duration,
    max_dependency_depth: usize,
}

/// Long-lived recommendation engine. Shared read-only across requests.
pub struct Advisor {
    capabilities: CapabilityStore,
    patterns: PatternStore,
    resolver: DependencyResolver,
    hierarchizer: Hierarchizer,
    reasoning: Arc<dyn ReasoningService>,
    weights: ScoringWeights,
    limits: Limits,
}

/// Mutable state of one request.
struct RequestState {
    deadline: Instant,
    catalog: KindCatalog,
    dependencies: DependencyMap,
    similarity: HashMap<ResourceIdentifier, f32>,
    tags: HashMap<ResourceIdentifier, BTreeSet<String>>,
    degraded: bool,
    notes: Vec<String>,
}

impl RequestState {
    fn degrade(&mut self, note: impl Into<String>) {
        let note = note.into();
        tracing::warn!(%note, "request degraded");
        self.degraded = true;
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

fn transition(stage: Stage) {
    tracing::debug!(%stage, "entering stage");
}

impl Advisor {
    pub fn new(collaborators: Collaborators, config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let Collaborators {
            index,
            embedder,
            reasoning,
            introspection,
        } = collaborators;

        Ok(Self {
            capabilities: CapabilityStore::new(
                index.clone(),
                embedder.clone(),
                config.vector.capabilities_collection.clone(),
                config.retrieval.capability_min_score,
            ),
            patterns: PatternStore::new(
                index,
                embedder,
                config.vector.patterns_collection.clone(),
                config.retrieval.pattern_min_score,
            ),
            resolver: DependencyResolver::new(introspection, config.dependencies.rules.clone())?,
            hierarchizer: Hierarchizer::new(&config.hierarchy)?,
            reasoning,
            weights: config.scoring.clone(),
            limits: Limits {
                capability_limit: config.retrieval.capability_limit,
                pattern_limit: config.retrieval.pattern_limit,
                catalog_limit: config.retrieval.catalog_limit,
                max_solutions: config.recommend.max_solutions,
                request_deadline: config.recommend.request_deadline(),
                call_timeout: config.recommend.call_timeout(),
                max_dependency_depth: config.recommend.max_dependency_depth,
            },
        })
    }

    /// Map a free-text intent to ranked, dependency-complete solutions.
    pub async fn recommend(&self, intent: &str, options: RecommendOptions) -> AdvisorResult<Recommendation> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("recommend", %request_id);
        async move {
            let result = self.run(intent, options).await;
            match &result {
                Ok(rec) => tracing::info!(
                    solutions = rec.solutions.len(),
                    degraded = rec.degraded,
                    "recommendation complete"
                ),
                Err(e) => {
                    transition(Stage::Error);
                    tracing::warn!(error = %e, "recommendation failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, intent: &str, options: RecommendOptions) -> AdvisorResult<Recommendation> {
        transition(Stage::Idle);
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(AdvisorError::InvalidRequest("intent must not be empty".into()));
        }
        let max_solutions = options.max_solutions.unwrap_or(self.limits.max_solutions);
        if !(1..=MAX_CANDIDATES).contains(&max_solutions) {
            return Err(AdvisorError::InvalidRequest(format!(
                "max_solutions must be between 1 and {}, got {}",
                MAX_CANDIDATES, max_solutions
            )));
        }

        let mut state = RequestState {
            deadline: Instant::now() + self.limits.request_deadline,
            catalog: KindCatalog::default(),
            dependencies: DependencyMap::new(),
            similarity: HashMap::new(),
            tags: HashMap::new(),
            degraded: false,
            notes: Vec::new(),
        };

        // ── Pass 1 ──────────────────────────────────────────────
        transition(Stage::RetrievingCapabilities);
        let deadline = state.deadline;
        let (capabilities, patterns, catalog) = tokio::join!(
            self.bounded(deadline, self.capabilities.search(intent, self.limits.capability_limit)),
            self.bounded(deadline, self.patterns.search(intent, self.limits.pattern_limit)),
            self.bounded(deadline, self.capabilities.identifiers(self.limits.catalog_limit)),
        );
        if state.expired() {
            return Err(AdvisorError::DeadlineExceeded {
                stage: Stage::RetrievingCapabilities,
            });
        }

        let capabilities = self.retrieval_outcome(&mut state, self.capabilities.collection(), capabilities);
        let patterns = self.retrieval_outcome(&mut state, self.patterns.collection(), patterns);

        let mut known: Vec<ResourceIdentifier> = match catalog {
            Some(Ok(ids)) => ids,
            Some(Err(e)) => {
                state.degrade(format!("kind catalog unavailable: {}", e));
                Vec::new()
            }
            None => {
                state.degrade("kind catalog unavailable: timed out");
                Vec::new()
            }
        };
        for hit in &capabilities.hits {
            state.similarity.insert(hit.record.id.clone(), hit.score);
            state
                .tags
                .insert(hit.record.id.clone(), hit.record.capability_tags.clone());
            known.push(hit.record.id.clone());
        }
        state.catalog = KindCatalog::new(known);
        tracing::debug!(
            capabilities = capabilities.hits.len(),
            patterns = patterns.hits.len(),
            catalog = state.catalog.len(),
            "retrieval complete"
        );

        transition(Stage::SelectingCandidates);
        // Anything the cluster knows is acceptable, not just this request's hits.
        let known: HashSet<ResourceIdentifier> = state.catalog.ids().iter().cloned().collect();
        let payload = select_payload(intent, &capabilities.hits, max_solutions);
        let selection = self
            .invoke_validated(&state, Stage::SelectingCandidates, PromptKind::Select, &payload, |resp| {
                parse_selection(resp, &known, max_solutions)
            })
            .await?;
        for warning in &selection.warnings {
            tracing::debug!(%warning, "selection coerced");
        }
        let mut solutions = selection.solutions;

        transition(Stage::ResolvingDependencies);
        if !self.close_dependencies(&mut state, &mut solutions, true).await {
            return Err(AdvisorError::DeadlineExceeded {
                stage: Stage::ResolvingDependencies,
            });
        }

        transition(Stage::RankingPass1);
        let pass1 = self
            .rank_pass1(&mut state, intent, solutions, max_solutions)
            .await;

        // ── Pass 2 ──────────────────────────────────────────────
        transition(Stage::RetrievingPatterns);
        if state.expired() {
            state.degrade(AdvisorError::DeadlineExceeded {
                stage: Stage::RetrievingPatterns,
            }
            .to_string());
            return Ok(self.done(state, pass1));
        }
        if patterns.hits.is_empty() {
            tracing::debug!("no matching patterns; returning pass 1 output");
            return Ok(self.done(state, pass1));
        }

        transition(Stage::EnhancingPass2);
        let payload = enhance_payload(intent, &pass1, &patterns.hits);
        let proposals = match self
            .invoke_validated(&state, Stage::EnhancingPass2, PromptKind::Enhance, &payload, parse_enhancement)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                state.degrade(e.to_string());
                return Ok(self.done(state, pass1));
            }
        };

        // Accepted proposals with their raw reasoning score; everything
        // else keeps its Pass 1 form untouched.
        let mut solutions = pass1.clone();
        let mut accepted: Vec<(usize, Option<f64>)> = Vec::new();
        let mut enhanced: Vec<CandidateSolution> = Vec::new();
        for (i, original) in pass1.iter().enumerate() {
            match proposals.get(&original.id) {
                None => {}
                Some(Err(reason)) => {
                    tracing::warn!(solution = %original.id, %reason, "undecodable enhancement; keeping pass 1 form");
                }
                Some(Ok(proposal)) => match apply_enhancement(original, proposal, &patterns.hits) {
                    Ok(candidate) if candidate.pattern_influence.is_some() => {
                        accepted.push((i, proposal.score));
                        enhanced.push(candidate);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "reverting to pass 1 form"),
                },
            }
        }

        // Pattern additions need their own foundations.
        if !self.close_dependencies(&mut state, &mut enhanced, false).await {
            state.degrade(AdvisorError::DeadlineExceeded {
                stage: Stage::EnhancingPass2,
            }
            .to_string());
            return Ok(self.done(state, pass1));
        }

        let tiers = self.tiers(&state, &enhanced);
        for ((i, raw_score), mut candidate) in accepted.into_iter().zip(enhanced) {
            if let Some(raw) = raw_score {
                let similarity = mean_similarity(&candidate, &state.similarity);
                let tier = best_tier(&candidate, &tiers);
                candidate.score = self.weights.pass1_score(raw, similarity, tier, &candidate);
            }
            solutions[i] = candidate;
        }

        Ok(self.done(state, solutions))
    }

    /// Run `fut` under the per-call timeout, cut short by the deadline.
    async fn bounded<F: Future>(&self, deadline: Instant, fut: F) -> Option<F::Output> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let limit = self.limits.call_timeout.min(deadline - now);
        tokio::time::timeout(limit, fut).await.ok()
    }

    fn retrieval_outcome<T>(
        &self,
        state: &mut RequestState,
        collection: &str,
        outcome: Option<Retrieval<T>>,
    ) -> Retrieval<T> {
        let retrieval = outcome.unwrap_or_else(|| Retrieval::degraded("timed out"));
        if let Some(reason) = &retrieval.degraded {
            state.degrade(
                AdvisorError::RetrievalDegraded {
                    collection: collection.to_string(),
                    reason: reason.clone(),
                }
                .to_string(),
            );
        }
        retrieval
    }

    /// Call the reasoning service and validate the response, retrying once
    /// with the strict instruction.
    async fn invoke_validated<T, P>(
        &self,
        state: &RequestState,
        stage: Stage,
        kind: PromptKind,
        payload: &Value,
        parse: P,
    ) -> AdvisorResult<T>
    where
        P: Fn(&Value) -> anyhow::Result<T>,
    {
        let mut last_err = String::new();
        for strict in [false, true] {
            match self
                .bounded(state.deadline, self.reasoning.invoke(kind, payload, strict))
                .await
            {
                None if state.expired() => return Err(AdvisorError::DeadlineExceeded { stage }),
                None => last_err = "reasoning call timed out".to_string(),
                Some(Err(e)) => last_err = format!("{:#}", e),
                Some(Ok(resp)) => match parse(&resp) {
                    Ok(value) => return Ok(value),
                    Err(e) => last_err = format!("{:#}", e),
                },
            }
            tracing::warn!(%stage, %kind, strict, error = %last_err, "reasoning response rejected");
        }
        Err(AdvisorError::ReasoningParse {
            stage,
            reason: last_err,
        })
    }

    /// Resolve every member and inject missing foundations until the
    /// solutions are closed or `max_dependency_depth` rounds have run.
    ///
    /// Returns `false` if the deadline expired first.
    async fn close_dependencies(
        &self,
        state: &mut RequestState,
        solutions: &mut [CandidateSolution],
        mark_incomplete: bool,
    ) -> bool {
        for round in 0..=self.limits.max_dependency_depth {
            let mut pending: Vec<ResourceIdentifier> = Vec::new();
            for solution in solutions.iter() {
                for id in unresolved(solution, &state.dependencies) {
                    if !pending.contains(&id) {
                        pending.push(id);
                    }
                }
            }

            if !pending.is_empty() {
                let deadline = state.deadline;
                let catalog = &state.catalog;
                let resolved = join_all(
                    pending
                        .iter()
                        .map(|id| self.bounded(deadline, self.resolver.resolve(id, catalog))),
                )
                .await;
                if state.expired() {
                    return false;
                }
                for (id, resolution) in pending.into_iter().zip(resolved) {
                    let resolution = resolution.unwrap_or_else(|| Resolution::unavailable(&id, "timed out"));
                    state.dependencies.insert(id, resolution);
                }
            }

            let mut injected_any = false;
            for solution in solutions.iter_mut() {
                let injected = inject_foundations(solution, &state.dependencies);
                if !injected.is_empty() {
                    injected_any = true;
                    if mark_incomplete {
                        solution.previously_incomplete = true;
                    }
                    tracing::debug!(solution = %solution.id, round, count = injected.len(), "injected dependencies");
                }
            }
            if !injected_any {
                return true;
            }
        }

        // Depth exhausted: the last injections were never resolved.
        for solution in solutions.iter() {
            if !is_complete(solution, &state.dependencies) || !unresolved(solution, &state.dependencies).is_empty() {
                tracing::warn!(solution = %solution.id, depth = self.limits.max_dependency_depth, "dependency closure truncated");
            }
        }
        true
    }

    fn tiers(&self, state: &RequestState, solutions: &[CandidateSolution]) -> HashMap<ResourceIdentifier, HierarchyTier> {
        let mut tiers = HashMap::new();
        for id in solutions.iter().flat_map(|s| s.resources.iter()) {
            tiers
                .entry(id.clone())
                .or_insert_with(|| self.hierarchizer.tier_with_tags(id, state.tags.get(id)));
        }
        tiers
    }

    async fn rank_pass1(
        &self,
        state: &mut RequestState,
        intent: &str,
        mut solutions: Vec<CandidateSolution>,
        max_solutions: usize,
    ) -> Vec<CandidateSolution> {
        let tiers = self.tiers(state, &solutions);
        let payload = rank_payload(intent, &solutions, &tiers);
        let ids: Vec<String> = solutions.iter().map(|s| s.id.clone()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let rankings = match self
            .invoke_validated(state, Stage::RankingPass1, PromptKind::Rank, &payload, |resp| {
                parse_ranking(resp, &id_refs)
            })
            .await
        {
            Ok(r) => r,
            Err(e) => {
                state.degrade(format!("{}; using draft scores", e));
                HashMap::new()
            }
        };

        for solution in &mut solutions {
            let base = match rankings.get(&solution.id) {
                Some(ranking) => {
                    for reason in &ranking.reasons {
                        if !solution.reasons.contains(reason) {
                            solution.reasons.push(reason.clone());
                        }
                    }
                    ranking.score
                }
                None => solution.score,
            };
            let similarity = mean_similarity(solution, &state.similarity);
            let tier = best_tier(solution, &tiers);
            solution.score = self.weights.pass1_score(base, similarity, tier, solution);
        }

        rank_solutions(&mut solutions, &tiers);
        let mut solutions = dedupe(solutions);
        solutions.truncate(max_solutions);
        solutions
    }

    fn done(&self, state: RequestState, mut solutions: Vec<CandidateSolution>) -> Recommendation {
        transition(Stage::Done);
        let tiers = self.tiers(&state, &solutions);
        rank_solutions(&mut solutions, &tiers);
        Recommendation {
            solutions: dedupe(solutions),
            degraded: state.degraded,
            notes: state.notes,
        }
    }
}

/// Drop later solutions whose resource set equals an earlier one.
fn dedupe(solutions: Vec<CandidateSolution>) -> Vec<CandidateSolution> {
    let mut seen: Vec<BTreeSet<ResourceIdentifier>> = Vec::new();
    solutions
        .into_iter()
        .filter(|s| {
            let set: BTreeSet<ResourceIdentifier> = s.resources.iter().cloned().collect();
            if seen.contains(&set) {
                false
            } else {
                seen.push(set);
                true
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(kind: &str) -> ResourceIdentifier {
        ResourceIdentifier::new("example.io", "v1", kind)
    }

    #[test]
    fn test_dedupe_ignores_order() {
        let a = CandidateSolution::new("a", vec![id("A"), id("B")], 80.0);
        let b = CandidateSolution::new("b", vec![id("B"), id("A")], 70.0);
        let c = CandidateSolution::new("c", vec![id("C")], 60.0);
        let out = dedupe(vec![a, b, c]);
        let ids: Vec<&str> = out.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_recommendation_serializes_without_empty_notes() {
        let rec = Recommendation {
            solutions: Vec::new(),
            degraded: false,
            notes: Vec::new(),
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("notes").is_none());
        assert_eq!(json["degraded"], false);
    }
}
