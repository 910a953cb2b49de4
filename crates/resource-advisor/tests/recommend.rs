//! End-to-end recommendation tests with in-memory collaborators.
//!
//! Capabilities and patterns live in an `InMemoryVectorIndex` embedded by
//! the `HashingEmbedder`; schemas come from `StaticSchemas`; the reasoning
//! service is scripted per prompt kind.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use resource_advisor::config::Config;
use resource_advisor::{Advisor, Collaborators, RecommendOptions, Recommendation};
use resource_advisor_core::dependencies::{inject_foundations, DependencyMap};
use resource_advisor_core::embedding::HashingEmbedder;
use resource_advisor_core::error::{AdvisorError, Stage};
use resource_advisor_core::index::memory::InMemoryVectorIndex;
use resource_advisor_core::index::{PayloadFilter, ScoredPoint, VectorIndex, VectorPoint};
use resource_advisor_core::models::{CapabilityRecord, ComplexityTier, PatternRecord, ResourceIdentifier};
use resource_advisor_core::reasoning::{PromptKind, ReasoningService};
use resource_advisor_core::schema::{ClusterIntrospection, SchemaDocument, StaticSchemas};
use resource_advisor_core::stores::IndexedRecord;

const DIMS: usize = 512;
const AZURE_INTENT: &str = "PostgreSQL database in Azure";
const WEB_INTENT: &str = "deploy stateless web app";
const PATTERN_ID: &str = "azure-resource-group";

// ============ Fixtures ============

fn server() -> ResourceIdentifier {
    ResourceIdentifier::new("dbforpostgresql.azure.com", "v1api20210601", "FlexibleServer")
}
fn firewall() -> ResourceIdentifier {
    ResourceIdentifier::new("dbforpostgresql.azure.com", "v1api20210601", "FlexibleServersFirewallRule")
}
fn resource_group() -> ResourceIdentifier {
    ResourceIdentifier::new("resources.azure.com", "v1api20200601", "ResourceGroup")
}
fn deployment() -> ResourceIdentifier {
    ResourceIdentifier::new("apps", "v1", "Deployment")
}
fn service() -> ResourceIdentifier {
    ResourceIdentifier::new("", "v1", "Service")
}
fn config_map() -> ResourceIdentifier {
    ResourceIdentifier::new("", "v1", "ConfigMap")
}
fn secret() -> ResourceIdentifier {
    ResourceIdentifier::new("", "v1", "Secret")
}

fn capability(id: ResourceIdentifier, description: &str, tags: &[&str], embedder: &HashingEmbedder) -> CapabilityRecord {
    let mut record = CapabilityRecord {
        id,
        description: description.to_string(),
        capability_tags: tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>(),
        provider_tags: BTreeSet::new(),
        complexity_tier: ComplexityTier::Medium,
        embedding: Vec::new(),
    };
    record.embedding = embedder.embed_text(&record.embedding_text());
    record
}

fn azure_pattern(embedder: &HashingEmbedder) -> PatternRecord {
    let mut pattern = PatternRecord {
        id: PATTERN_ID.to_string(),
        trigger_description: AZURE_INTENT.to_string(),
        suggested_resources: vec![resource_group()],
        rationale: "Every Azure resource lives in a resource group".to_string(),
        embedding: Vec::new(),
    };
    pattern.embedding = embedder.embed_text(&pattern.embedding_text());
    pattern
}

async fn seeded_index(embedder: &HashingEmbedder, with_patterns: bool) -> Arc<InMemoryVectorIndex> {
    let index = Arc::new(InMemoryVectorIndex::new());
    let capabilities = vec![
        capability(server(), "Azure managed PostgreSQL flexible server database", &["postgresql", "database"], embedder),
        capability(firewall(), "Firewall rule for an Azure PostgreSQL flexible server", &["network"], embedder),
        capability(resource_group(), "Azure resource group container", &["azure"], embedder),
        capability(deployment(), "Stateless web application workload", &["web"], embedder),
        capability(service(), "Network endpoint exposing a web app", &["network"], embedder),
        capability(config_map(), "Application configuration values", &["config"], embedder),
        capability(secret(), "Sensitive credentials", &["credentials"], embedder),
    ];
    let points = capabilities.iter().map(|c| c.to_point().unwrap()).collect();
    index.upsert("capabilities", points).await.unwrap();
    if with_patterns {
        index
            .upsert("patterns", vec![azure_pattern(embedder).to_point().unwrap()])
            .await
            .unwrap();
    }
    index
}

fn schema(id: ResourceIdentifier, spec: Value) -> SchemaDocument {
    SchemaDocument::from_openapi(id, &json!({"type": "object", "properties": {"spec": spec}}), None).unwrap()
}

fn schemas() -> StaticSchemas {
    StaticSchemas::new()
        .with(schema(
            server(),
            json!({"type": "object", "properties": {
                "owner": {"type": "object", "description": "Owner is expected to be a reference to a resources.azure.com/ResourceGroup resource"},
                "version": {"type": "string"}
            }}),
        ))
        .with(schema(
            firewall(),
            json!({"type": "object", "required": ["flexibleServerName"], "properties": {
                "flexibleServerName": {"type": "string"},
                "startIpAddress": {"type": "string"}
            }}),
        ))
        .with(schema(
            resource_group(),
            json!({"type": "object", "required": ["location"], "properties": {"location": {"type": "string"}}}),
        ))
        .with(schema(
            deployment(),
            json!({"type": "object", "required": ["selector"], "properties": {
                "selector": {"type": "object"},
                "serviceAccountName": {"type": "string"}
            }}),
        ))
        .with(schema(
            service(),
            json!({"type": "object", "properties": {"selector": {"type": "object"}}}),
        ))
        .with(schema(config_map(), json!({"type": "object", "properties": {}})))
        .with(schema(secret(), json!({"type": "object", "properties": {}})))
}

/// `schemas()` with the server's owner required, so the resource group is
/// a foundation of the server.
fn owner_required_schemas() -> StaticSchemas {
    schemas().with(schema(
        server(),
        json!({"type": "object", "required": ["owner"], "properties": {
            "owner": {"type": "object", "description": "Owner is expected to be a reference to a resources.azure.com/ResourceGroup resource"},
            "version": {"type": "string"}
        }}),
    ))
}

/// Introspection that fails for one identifier.
struct FailingFor {
    inner: StaticSchemas,
    broken: ResourceIdentifier,
}

#[async_trait]
impl ClusterIntrospection for FailingFor {
    async fn get_schema(&self, id: &ResourceIdentifier) -> Result<Option<SchemaDocument>> {
        if *id == self.broken {
            bail!("connection reset by peer");
        }
        self.inner.get_schema(id).await
    }
}

/// Introspection that stalls, for every identifier or only one.
struct SlowSchemas {
    inner: StaticSchemas,
    only: Option<ResourceIdentifier>,
    delay: Duration,
}

#[async_trait]
impl ClusterIntrospection for SlowSchemas {
    async fn get_schema(&self, id: &ResourceIdentifier) -> Result<Option<SchemaDocument>> {
        if self.only.as_ref().map(|only| only == id).unwrap_or(true) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get_schema(id).await
    }
}

struct DownIndex;

#[async_trait]
impl VectorIndex for DownIndex {
    async fn upsert(&self, _: &str, _: Vec<VectorPoint>) -> Result<()> {
        bail!("connection refused")
    }
    async fn search_by_embedding(&self, _: &str, _: &[f32], _: usize) -> Result<Vec<ScoredPoint>> {
        bail!("connection refused")
    }
    async fn search_by_filter(&self, _: &str, _: &PayloadFilter, _: usize) -> Result<Vec<VectorPoint>> {
        bail!("connection refused")
    }
    async fn get(&self, _: &str, _: &str) -> Result<Option<VectorPoint>> {
        bail!("connection refused")
    }
    async fn delete(&self, _: &str, _: &str) -> Result<bool> {
        bail!("connection refused")
    }
}

// ============ Scripted reasoning ============

type Script = Box<dyn Fn(PromptKind, &Value, bool) -> Result<Value> + Send + Sync>;

struct ScriptedReasoning {
    script: Script,
    delay: Option<(PromptKind, Duration)>,
    calls: Mutex<Vec<(PromptKind, bool)>>,
}

impl ScriptedReasoning {
    fn new(script: impl Fn(PromptKind, &Value, bool) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(PromptKind, bool)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, kind: PromptKind) -> usize {
        self.calls().iter().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn invoke(&self, kind: PromptKind, context: &Value, strict: bool) -> Result<Value> {
        self.calls.lock().unwrap().push((kind, strict));
        if let Some((slow, delay)) = self.delay {
            if slow == kind {
                tokio::time::sleep(delay).await;
            }
        }
        (self.script)(kind, context, strict)
    }
}

fn ids(resources: &[ResourceIdentifier]) -> Value {
    serde_json::to_value(resources).unwrap()
}

fn selection(solutions: Vec<(Vec<ResourceIdentifier>, f64)>) -> Value {
    let items: Vec<Value> = solutions
        .into_iter()
        .map(|(resources, score)| json!({"resources": ids(&resources), "score": score, "reasons": ["matches intent"]}))
        .collect();
    json!({ "solutions": items })
}

/// Rank every solution in payload order: 90, 80, 70, ...
fn rank_all(payload: &Value) -> Value {
    let rankings: Vec<Value> = payload["solutions"]
        .as_array()
        .map(|all| {
            all.iter()
                .enumerate()
                .map(|(i, s)| json!({"id": s["id"], "score": 90 - 10 * i as i64, "reasons": ["ranked"]}))
                .collect()
        })
        .unwrap_or_default();
    json!({ "rankings": rankings })
}

/// Append the resource group to every solution.
fn enhance_with_resource_group(payload: &Value) -> Value {
    let rg = serde_json::to_value(resource_group()).unwrap();
    let solutions: Vec<Value> = payload["solutions"]
        .as_array()
        .map(|all| {
            all.iter()
                .map(|s| {
                    let mut resources = s["resources"].as_array().cloned().unwrap_or_default();
                    if !resources.contains(&rg) {
                        resources.push(rg.clone());
                    }
                    json!({
                        "id": s["id"],
                        "resources": resources,
                        "reasons": ["organization requires a resource group"],
                        "patternInfluence": {"patternId": PATTERN_ID}
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "solutions": solutions })
}

fn azure_script(kind: PromptKind, payload: &Value, _strict: bool) -> Result<Value> {
    Ok(match kind {
        PromptKind::Select => selection(vec![
            (vec![server(), firewall()], 80.0),
            (vec![firewall(), secret()], 60.0),
        ]),
        PromptKind::Rank => rank_all(payload),
        PromptKind::Enhance => enhance_with_resource_group(payload),
    })
}

fn web_script(kind: PromptKind, payload: &Value, _strict: bool) -> Result<Value> {
    Ok(match kind {
        PromptKind::Select => selection(vec![
            (vec![deployment(), service()], 85.0),
            (vec![deployment()], 70.0),
        ]),
        PromptKind::Rank => rank_all(payload),
        PromptKind::Enhance => bail!("enhance must not be called without patterns"),
    })
}

fn config(recommend: &str, extra: &str) -> Config {
    Config::from_toml_str(&format!(
        "[vector]\nurl = \"memory://\"\n\n[recommend]\n{}\n\n{}\n",
        recommend, extra
    ))
    .unwrap()
}

fn test_config() -> Config {
    config("request_deadline_secs = 30\ncall_timeout_secs = 1", "")
}

/// Three-second deadline with two-second calls.
fn tight_config() -> Config {
    config("request_deadline_secs = 3\ncall_timeout_secs = 2", "")
}

struct Harness {
    advisor: Advisor,
    reasoning: Arc<ScriptedReasoning>,
}

async fn harness(
    reasoning: ScriptedReasoning,
    with_patterns: bool,
    introspection: Arc<dyn ClusterIntrospection>,
) -> Harness {
    harness_with(reasoning, with_patterns, introspection, &test_config()).await
}

async fn harness_with(
    reasoning: ScriptedReasoning,
    with_patterns: bool,
    introspection: Arc<dyn ClusterIntrospection>,
    config: &Config,
) -> Harness {
    let embedder = Arc::new(HashingEmbedder::new(DIMS));
    let index = seeded_index(&embedder, with_patterns).await;
    let reasoning = Arc::new(reasoning);
    let collaborators = Collaborators {
        index,
        embedder,
        reasoning: reasoning.clone(),
        introspection,
    };
    Harness {
        advisor: Advisor::new(collaborators, config).unwrap(),
        reasoning,
    }
}

async fn recommend(h: &Harness, intent: &str) -> Recommendation {
    h.advisor
        .recommend(intent, RecommendOptions::default())
        .await
        .unwrap()
}

/// Every foundation target of every member is present.
async fn assert_complete(rec: &Recommendation) {
    let resolver = resource_advisor_core::dependencies::DependencyResolver::new(Arc::new(schemas()), Vec::new()).unwrap();
    let catalog = resource_advisor_core::dependencies::KindCatalog::new(vec![
        server(),
        firewall(),
        resource_group(),
        deployment(),
        service(),
        config_map(),
        secret(),
    ]);
    for solution in &rec.solutions {
        let mut map = DependencyMap::new();
        for id in &solution.resources {
            map.insert(id.clone(), resolver.resolve(id, &catalog).await);
        }
        let mut copy = solution.clone();
        assert!(
            inject_foundations(&mut copy, &map).is_empty(),
            "solution {} is missing a foundation dependency",
            solution.id
        );
    }
}

// ============ Scenarios ============

#[tokio::test]
async fn test_pattern_adds_resource_group() {
    let pass1 = recommend(&harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await, AZURE_INTENT).await;
    let h = harness(ScriptedReasoning::new(azure_script), true, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    assert!(!rec.degraded, "notes: {:?}", rec.notes);
    assert!(!rec.solutions.is_empty());
    let first = rec.solutions.iter().find(|s| s.id == "solution-1").unwrap();
    assert_eq!(first.resources, vec![server(), firewall(), resource_group()]);
    let influence = first.pattern_influence.as_ref().unwrap();
    assert_eq!(influence.pattern_id, PATTERN_ID);
    assert_eq!(influence.added_resources, vec![resource_group()]);
    assert!(rec.solutions.iter().all(|s| s.contains(&resource_group())));

    // Pass 2 only appended.
    for solution in &rec.solutions {
        let before = pass1.solutions.iter().find(|s| s.id == solution.id).unwrap();
        assert_eq!(&solution.resources[..before.resources.len()], &before.resources[..]);
    }
    assert_complete(&rec).await;
    assert_eq!(h.reasoning.count(PromptKind::Enhance), 1);
}

#[tokio::test]
async fn test_missing_foundation_is_injected() {
    let h = harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    let second = rec.solutions.iter().find(|s| s.id == "solution-2").unwrap();
    assert_eq!(second.resources, vec![firewall(), secret(), server()]);
    assert_eq!(second.injected, vec![server()]);
    assert!(second.previously_incomplete);
    assert!(second.reasons.iter().any(|r| r.contains("required by")));

    let first = rec.solutions.iter().find(|s| s.id == "solution-1").unwrap();
    assert!(!first.previously_incomplete);
    assert!(first.injected.is_empty());
    assert_complete(&rec).await;
}

#[tokio::test]
async fn test_no_pattern_returns_pass1_output() {
    let h = harness(ScriptedReasoning::new(web_script), true, Arc::new(schemas())).await;
    let rec = recommend(&h, WEB_INTENT).await;

    assert!(!rec.degraded, "notes: {:?}", rec.notes);
    assert!(rec.notes.is_empty());
    assert_eq!(h.reasoning.count(PromptKind::Enhance), 0);
    assert!(rec.solutions.iter().all(|s| s.pattern_influence.is_none()));
    assert!(rec.solutions.iter().any(|s| !s.contains(&resource_group())));

    // Same output with no pattern collection at all.
    let without = recommend(&harness(ScriptedReasoning::new(web_script), false, Arc::new(schemas())).await, WEB_INTENT).await;
    assert_eq!(rec.solutions, without.solutions);
}

#[tokio::test]
async fn test_schema_failure_is_annotated() {
    let script = |kind: PromptKind, payload: &Value, _: bool| -> Result<Value> {
        Ok(match kind {
            PromptKind::Select => selection(vec![(vec![deployment(), service(), config_map()], 75.0)]),
            PromptKind::Rank => rank_all(payload),
            PromptKind::Enhance => bail!("unused"),
        })
    };
    let introspection = Arc::new(FailingFor {
        inner: schemas(),
        broken: config_map(),
    });
    let h = harness(ScriptedReasoning::new(script), false, introspection).await;
    let rec = recommend(&h, WEB_INTENT).await;

    assert_eq!(rec.solutions.len(), 1);
    let solution = &rec.solutions[0];
    assert_eq!(solution.resources, vec![deployment(), service(), config_map()]);
    assert_eq!(solution.warnings.len(), 1);
    assert!(solution.warnings[0].starts_with("Schema unavailable for ConfigMap/v1"), "{:?}", solution.warnings);
    assert!(solution.warnings[0].contains("connection reset"));
}

#[tokio::test]
async fn test_removal_reverts_to_pass1_form() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        match kind {
            PromptKind::Enhance => {
                let mut resp = enhance_with_resource_group(payload);
                // Drop the first Pass 1 resource of solution-1.
                for s in resp["solutions"].as_array_mut().unwrap() {
                    if s["id"] == "solution-1" {
                        s["resources"].as_array_mut().unwrap().remove(0);
                    }
                }
                Ok(resp)
            }
            other => azure_script(other, payload, strict),
        }
    };
    let pass1 = recommend(&harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await, AZURE_INTENT).await;
    let h = harness(ScriptedReasoning::new(script), true, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    let reverted = rec.solutions.iter().find(|s| s.id == "solution-1").unwrap();
    let original = pass1.solutions.iter().find(|s| s.id == "solution-1").unwrap();
    assert_eq!(reverted, original);

    let other = rec.solutions.iter().find(|s| s.id == "solution-2").unwrap();
    assert!(other.contains(&resource_group()), "valid proposals are still applied");
}

#[tokio::test]
async fn test_unsuggested_addition_reverts() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        match kind {
            PromptKind::Enhance => {
                let mut resp = enhance_with_resource_group(payload);
                let extra = serde_json::to_value(config_map()).unwrap();
                for s in resp["solutions"].as_array_mut().unwrap() {
                    s["resources"].as_array_mut().unwrap().push(extra.clone());
                }
                Ok(resp)
            }
            other => azure_script(other, payload, strict),
        }
    };
    let h = harness(ScriptedReasoning::new(script), true, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;
    assert!(rec.solutions.iter().all(|s| !s.contains(&config_map())));
    assert!(rec.solutions.iter().all(|s| s.pattern_influence.is_none()));
}

// ============ Properties ============

#[tokio::test]
async fn test_recommend_is_idempotent() {
    let h = harness(ScriptedReasoning::new(azure_script), true, Arc::new(schemas())).await;
    let first = recommend(&h, AZURE_INTENT).await;
    let second = recommend(&h, AZURE_INTENT).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_solutions_are_ranked_and_bounded() {
    let h = harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await;
    let rec = h
        .advisor
        .recommend(AZURE_INTENT, RecommendOptions { max_solutions: Some(1) })
        .await
        .unwrap();
    assert_eq!(rec.solutions.len(), 1);

    let rec = recommend(&h, AZURE_INTENT).await;
    assert!(rec
        .solutions
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
    assert!(rec.solutions.iter().all(|s| (0.0..=100.0).contains(&s.score)));
}

// ============ Failure handling ============

#[tokio::test]
async fn test_vector_backend_down_degrades() {
    let reasoning = Arc::new(ScriptedReasoning::new(web_script));
    let config = test_config();
    let advisor = Advisor::new(
        Collaborators {
            index: Arc::new(DownIndex),
            embedder: Arc::new(HashingEmbedder::new(DIMS)),
            reasoning: reasoning.clone(),
            introspection: Arc::new(schemas()),
        },
        &config,
    )
    .unwrap();

    let rec = advisor
        .recommend(WEB_INTENT, RecommendOptions::default())
        .await
        .unwrap();
    assert!(rec.degraded);
    assert!(rec.notes.iter().any(|n| n.contains("Retrieval degraded (capabilities)")), "{:?}", rec.notes);
    assert!(rec.notes.iter().any(|n| n.contains("Retrieval degraded (patterns)")));
    assert!(!rec.solutions.is_empty());
    assert_eq!(reasoning.count(PromptKind::Enhance), 0);
}

#[tokio::test]
async fn test_selection_parse_failure_is_fatal() {
    let h = harness(
        ScriptedReasoning::new(|_, _, _| Ok(json!({"answer": "use postgres"}))),
        true,
        Arc::new(schemas()),
    )
    .await;
    let err = h
        .advisor
        .recommend(AZURE_INTENT, RecommendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AdvisorError::ReasoningParse {
            stage: Stage::SelectingCandidates,
            ..
        }
    ));
    assert_eq!(
        h.reasoning.calls(),
        vec![(PromptKind::Select, false), (PromptKind::Select, true)],
        "one strict retry, then give up"
    );
}

#[tokio::test]
async fn test_strict_retry_recovers() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        if kind == PromptKind::Select && !strict {
            return Ok(json!({"text": "Sure! Here are some ideas."}));
        }
        azure_script(kind, payload, strict)
    };
    let h = harness(ScriptedReasoning::new(script), false, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;
    assert!(!rec.solutions.is_empty());
    assert!(!rec.degraded);
}

#[tokio::test]
async fn test_rank_failure_uses_draft_scores() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        match kind {
            PromptKind::Rank => bail!("model overloaded"),
            other => web_script(other, payload, strict),
        }
    };
    let h = harness(ScriptedReasoning::new(script), false, Arc::new(schemas())).await;
    let rec = recommend(&h, WEB_INTENT).await;
    assert!(rec.degraded);
    assert!(rec.notes.iter().any(|n| n.contains("draft scores")), "{:?}", rec.notes);
    assert_eq!(rec.solutions.len(), 2);
}

#[tokio::test]
async fn test_enhance_failure_returns_pass1() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        match kind {
            PromptKind::Enhance => Ok(json!({"unexpected": true})),
            other => azure_script(other, payload, strict),
        }
    };
    let pass1 = recommend(&harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await, AZURE_INTENT).await;
    let h = harness(ScriptedReasoning::new(script), true, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;
    assert!(rec.degraded);
    assert_eq!(rec.solutions, pass1.solutions);
    assert_eq!(h.reasoning.count(PromptKind::Enhance), 2);
}

#[tokio::test]
async fn test_slow_ranking_times_out() {
    let mut reasoning = ScriptedReasoning::new(web_script);
    reasoning.delay = Some((PromptKind::Rank, Duration::from_secs(5)));
    let h = harness(reasoning, false, Arc::new(schemas())).await;
    let rec = recommend(&h, WEB_INTENT).await;
    assert!(rec.degraded);
    assert!(rec.notes.iter().any(|n| n.contains("timed out")), "{:?}", rec.notes);
    assert!(!rec.solutions.is_empty());
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let h = harness(ScriptedReasoning::new(web_script), false, Arc::new(schemas())).await;
    let err = h
        .advisor
        .recommend("   ", RecommendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AdvisorError::InvalidRequest(_)));

    let err = h
        .advisor
        .recommend(WEB_INTENT, RecommendOptions { max_solutions: Some(9) })
        .await
        .unwrap_err();
    assert!(matches!(err, AdvisorError::InvalidRequest(_)));
    assert!(h.reasoning.calls().is_empty());
}

#[tokio::test]
async fn test_deadline_during_resolution_is_fatal() {
    let mut reasoning = ScriptedReasoning::new(azure_script);
    reasoning.delay = Some((PromptKind::Select, Duration::from_millis(1500)));
    let introspection = Arc::new(SlowSchemas {
        inner: schemas(),
        only: None,
        delay: Duration::from_secs(10),
    });
    let h = harness_with(reasoning, true, introspection, &tight_config()).await;
    let err = h
        .advisor
        .recommend(AZURE_INTENT, RecommendOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            AdvisorError::DeadlineExceeded {
                stage: Stage::ResolvingDependencies
            }
        ),
        "{}",
        err
    );
    assert_eq!(h.reasoning.count(PromptKind::Rank), 0);
}

#[tokio::test]
async fn test_slow_enhancement_returns_pass1() {
    let pass1 = recommend(&harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await, AZURE_INTENT).await;
    let mut reasoning = ScriptedReasoning::new(azure_script);
    reasoning.delay = Some((PromptKind::Enhance, Duration::from_secs(5)));
    let h = harness(reasoning, true, Arc::new(schemas())).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    assert!(rec.degraded);
    assert!(rec.notes.iter().any(|n| n.contains("timed out")), "{:?}", rec.notes);
    assert_eq!(rec.solutions, pass1.solutions);
    assert_eq!(h.reasoning.count(PromptKind::Enhance), 2);
}

#[tokio::test]
async fn test_deadline_during_enhancement_returns_pass1() {
    let pass1 = recommend(&harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await, AZURE_INTENT).await;
    let mut reasoning = ScriptedReasoning::new(azure_script);
    reasoning.delay = Some((PromptKind::Enhance, Duration::from_secs(10)));
    let h = harness_with(reasoning, true, Arc::new(schemas()), &tight_config()).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    assert!(rec.degraded);
    assert!(
        rec.notes.iter().any(|n| n.contains("Request deadline exceeded during enhancing-pass2")),
        "{:?}",
        rec.notes
    );
    assert_eq!(rec.solutions, pass1.solutions);
}

#[tokio::test]
async fn test_deadline_during_pattern_dependencies_returns_pass1() {
    let pass1 = recommend(&harness(ScriptedReasoning::new(azure_script), false, Arc::new(schemas())).await, AZURE_INTENT).await;
    let mut reasoning = ScriptedReasoning::new(azure_script);
    reasoning.delay = Some((PromptKind::Enhance, Duration::from_millis(1500)));
    // Only the pattern's addition is slow; Pass 1 never resolves it.
    let introspection = Arc::new(SlowSchemas {
        inner: schemas(),
        only: Some(resource_group()),
        delay: Duration::from_secs(10),
    });
    let h = harness_with(reasoning, true, introspection, &tight_config()).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    assert!(rec.degraded);
    assert!(
        rec.notes.iter().any(|n| n.contains("Request deadline exceeded during enhancing-pass2")),
        "{:?}",
        rec.notes
    );
    assert_eq!(rec.solutions, pass1.solutions);
    assert!(rec.solutions.iter().all(|s| s.pattern_influence.is_none()));
}

#[tokio::test]
async fn test_other_served_version_satisfies_foundation() {
    let rg_beta = ResourceIdentifier::new("resources.azure.com", "v1beta20200601", "ResourceGroup");
    let embedder = Arc::new(HashingEmbedder::new(DIMS));
    let index = seeded_index(&embedder, false).await;
    index
        .upsert(
            "capabilities",
            vec![capability(rg_beta.clone(), "Azure resource group container (beta)", &["azure"], &embedder)
                .to_point()
                .unwrap()],
        )
        .await
        .unwrap();
    let introspection = owner_required_schemas().with(schema(
        rg_beta.clone(),
        json!({"type": "object", "required": ["location"], "properties": {"location": {"type": "string"}}}),
    ));
    let selected = rg_beta.clone();
    let reasoning = Arc::new(ScriptedReasoning::new(move |kind, payload, _| {
        Ok(match kind {
            PromptKind::Select => selection(vec![(vec![server(), selected.clone()], 80.0)]),
            PromptKind::Rank => rank_all(payload),
            PromptKind::Enhance => bail!("unused"),
        })
    }));
    let advisor = Advisor::new(
        Collaborators {
            index,
            embedder,
            reasoning,
            introspection: Arc::new(introspection),
        },
        &test_config(),
    )
    .unwrap();

    let rec = advisor
        .recommend(AZURE_INTENT, RecommendOptions::default())
        .await
        .unwrap();
    let solution = &rec.solutions[0];
    assert_eq!(solution.resources, vec![server(), rg_beta], "no second ResourceGroup version");
    assert!(solution.injected.is_empty());
    assert!(!solution.previously_incomplete);
}

#[tokio::test]
async fn test_enhanced_scores_use_pass1_scale() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        match kind {
            PromptKind::Enhance => {
                let mut resp = enhance_with_resource_group(payload);
                for s in resp["solutions"].as_array_mut().unwrap() {
                    s["score"] = json!(40);
                }
                Ok(resp)
            }
            other => azure_script(other, payload, strict),
        }
    };
    let config = config(
        "request_deadline_secs = 30\ncall_timeout_secs = 1",
        "[scoring]\nsemantic_weight = 0.0\ncomposite_bonus = 0.0\noperator_bonus = 0.0\ninjected_dependency_penalty = 10.0\nmax_injected_penalty = 10.0\nunresolved_schema_penalty = 0.0",
    );
    let h = harness_with(ScriptedReasoning::new(script), true, Arc::new(schemas()), &config).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    let first = rec.solutions.iter().find(|s| s.id == "solution-1").unwrap();
    let second = rec.solutions.iter().find(|s| s.id == "solution-2").unwrap();
    assert!(first.pattern_influence.is_some() && second.pattern_influence.is_some());
    assert_eq!(first.score, 40.0);
    assert_eq!(second.score, 30.0, "injected-dependency penalty still applies");
    assert_eq!(rec.solutions[0].id, "solution-1");
}

#[tokio::test]
async fn test_reverted_candidate_not_closed_further() {
    let script = |kind: PromptKind, payload: &Value, strict: bool| -> Result<Value> {
        match kind {
            PromptKind::Enhance => {
                let mut resp = enhance_with_resource_group(payload);
                for s in resp["solutions"].as_array_mut().unwrap() {
                    if s["id"] == "solution-2" {
                        s["resources"].as_array_mut().unwrap().remove(0);
                    }
                }
                Ok(resp)
            }
            other => azure_script(other, payload, strict),
        }
    };
    // Depth 0 leaves solution-2 without the server's resource group.
    let config = config("request_deadline_secs = 30\ncall_timeout_secs = 1\nmax_dependency_depth = 0", "");
    let pass1 = recommend(
        &harness_with(ScriptedReasoning::new(azure_script), false, Arc::new(owner_required_schemas()), &config).await,
        AZURE_INTENT,
    )
    .await;
    let h = harness_with(ScriptedReasoning::new(script), true, Arc::new(owner_required_schemas()), &config).await;
    let rec = recommend(&h, AZURE_INTENT).await;

    let original = pass1.solutions.iter().find(|s| s.id == "solution-2").unwrap();
    assert_eq!(original.resources, vec![firewall(), secret(), server()]);
    let reverted = rec.solutions.iter().find(|s| s.id == "solution-2").unwrap();
    assert_eq!(reverted, original);
    assert!(!reverted.contains(&resource_group()));
}
