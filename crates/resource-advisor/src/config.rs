//! TOML configuration parsing and validation.
//!
//! Every section except `[vector]` is optional and falls back to defaults.
//! [`load_config`] parses a file and runs [`Config::validate`];
//! [`Config::from_toml_str`] does the same for an in-memory string.
//!
//! ```toml
//! [vector]
//! url = "http://localhost:6333"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [reasoning]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [hierarchy]
//! composite_groups = ["*.devopstoolkit.live"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use resource_advisor_core::dependencies::RefRule;
use resource_advisor_core::hierarchy::{Hierarchizer, HierarchyRules};
use resource_advisor_core::scoring::ScoringWeights;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vector: VectorConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub introspection: IntrospectionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub recommend: RecommendConfig,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub hierarchy: HierarchyRules,
    #[serde(default)]
    pub dependencies: DependenciesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorConfig {
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_capabilities_collection")]
    pub capabilities_collection: String,
    #[serde(default = "default_patterns_collection")]
    pub patterns_collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_capabilities_collection() -> String {
    "capabilities".to_string()
}
fn default_patterns_collection() -> String {
    "patterns".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_reasoning_url")]
    pub url: String,
    #[serde(default = "default_reasoning_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reasoning_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: default_reasoning_url(),
            api_key_env: default_reasoning_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_reasoning_timeout_secs(),
            temperature: 0.0,
        }
    }
}

fn default_reasoning_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_reasoning_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_reasoning_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntrospectionConfig {
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            context: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_capability_limit")]
    pub capability_limit: usize,
    #[serde(default = "default_pattern_limit")]
    pub pattern_limit: usize,
    #[serde(default = "default_capability_min_score")]
    pub capability_min_score: f32,
    #[serde(default = "default_pattern_min_score")]
    pub pattern_min_score: f32,
    #[serde(default = "default_catalog_limit")]
    pub catalog_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            capability_limit: default_capability_limit(),
            pattern_limit: default_pattern_limit(),
            capability_min_score: default_capability_min_score(),
            pattern_min_score: default_pattern_min_score(),
            catalog_limit: default_catalog_limit(),
        }
    }
}

fn default_capability_limit() -> usize {
    50
}
fn default_pattern_limit() -> usize {
    10
}
fn default_capability_min_score() -> f32 {
    0.25
}
fn default_pattern_min_score() -> f32 {
    0.5
}
fn default_catalog_limit() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecommendConfig {
    #[serde(default = "default_max_solutions")]
    pub max_solutions: usize,
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_dependency_depth")]
    pub max_dependency_depth: usize,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            max_solutions: default_max_solutions(),
            request_deadline_secs: default_request_deadline_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_dependency_depth: default_max_dependency_depth(),
        }
    }
}

impl RecommendConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_max_solutions() -> usize {
    5
}
fn default_request_deadline_secs() -> u64 {
    180
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_max_dependency_depth() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DependenciesConfig {
    /// Extra reference conventions appended to the built-in table.
    #[serde(default)]
    pub rules: Vec<RefRule>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}

fn default_log_filter() -> String {
    "info,resource_advisor=debug".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Vector index
        if self.vector.url.trim().is_empty() {
            bail!("vector.url must not be empty");
        }
        if self.vector.capabilities_collection == self.vector.patterns_collection {
            bail!("vector.capabilities_collection and vector.patterns_collection must differ");
        }

        // Timeouts
        for (name, secs) in [
            ("vector.timeout_secs", self.vector.timeout_secs),
            ("embedding.timeout_secs", self.embedding.timeout_secs),
            ("reasoning.timeout_secs", self.reasoning.timeout_secs),
            ("introspection.timeout_secs", self.introspection.timeout_secs),
            ("recommend.call_timeout_secs", self.recommend.call_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{} must be > 0", name);
            }
        }
        if self.recommend.call_timeout_secs >= self.recommend.request_deadline_secs {
            bail!("recommend.call_timeout_secs must be shorter than recommend.request_deadline_secs");
        }

        // Recommendation
        if !(1..=5).contains(&self.recommend.max_solutions) {
            bail!("recommend.max_solutions must be between 1 and 5");
        }
        if self.retrieval.capability_limit == 0 {
            bail!("retrieval.capability_limit must be > 0");
        }
        for (name, score) in [
            ("retrieval.capability_min_score", self.retrieval.capability_min_score),
            ("retrieval.pattern_min_score", self.retrieval.pattern_min_score),
        ] {
            if !(0.0..=1.0).contains(&score) {
                bail!("{} must be in [0.0, 1.0]", name);
            }
        }

        self.scoring.validate()?;
        Hierarchizer::new(&self.hierarchy).context("invalid [hierarchy] section")?;
        for rule in &self.dependencies.rules {
            rule.validate()?;
        }

        // Embedding
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "hashing" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hashing.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.provider != "hashing" && self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        // Reasoning
        match self.reasoning.provider.as_str() {
            "disabled" => {}
            "openai" => {
                if self.reasoning.model.is_none() {
                    bail!("reasoning.model must be specified when provider is 'openai'");
                }
            }
            other => bail!(
                "Unknown reasoning provider: '{}'. Must be disabled or openai.",
                other
            ),
        }

        match self.logging.format.as_str() {
            "compact" | "json" => {}
            other => bail!("logging.format must be compact or json, got '{}'", other),
        }

        Ok(())
    }

    /// Settings that are valid but leave every request degraded or failing.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.embedding.is_enabled() {
            warnings.push(
                "embedding.provider is 'disabled': capability and pattern retrieval will be degraded on every request"
                    .to_string(),
            );
        }
        if self.reasoning.provider == "disabled" {
            warnings.push("reasoning.provider is 'disabled': every recommendation will fail at selection".to_string());
        }
        warnings
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[vector]
url = "http://localhost:6333"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.retrieval.capability_limit, 50);
        assert_eq!(cfg.recommend.max_solutions, 5);
        assert_eq!(cfg.vector.capabilities_collection, "capabilities");
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(cfg.scoring, ScoringWeights::default());
        assert!(cfg.recommend.call_timeout() < cfg.recommend.request_deadline());
    }

    #[test]
    fn test_full_config_parses() {
        let content = r#"
[vector]
url = "http://qdrant:6333"
api_key_env = "QDRANT_API_KEY"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536

[reasoning]
provider = "openai"
model = "gpt-4o-mini"

[scoring]
semantic_weight = 0.3
composite_bonus = 10.0

[hierarchy]
composite_groups = ["*.devopstoolkit.live"]

[[dependencies.rules]]
name = "vault"
field_pattern = "^vaultPath$"
shape = "string"
target_kind = "Secret"
target_group = ""

[logging]
format = "json"
"#;
        let cfg = Config::from_toml_str(content).unwrap();
        assert_eq!(cfg.scoring.semantic_weight, 0.3);
        assert_eq!(cfg.scoring.operator_bonus, 2.0);
        assert_eq!(cfg.dependencies.rules.len(), 1);
        assert_eq!(cfg.hierarchy.composite_groups, vec!["*.devopstoolkit.live"]);
        assert!(!cfg.hierarchy.operator_groups.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("[vector]\nurl = \"\"\n", "vector.url"),
            ("[vector]\nurl = \"x\"\n[recommend]\nmax_solutions = 9\n", "max_solutions"),
            ("[vector]\nurl = \"x\"\n[recommend]\ncall_timeout_secs = 200\nrequest_deadline_secs = 100\n", "shorter"),
            ("[vector]\nurl = \"x\"\n[embedding]\nprovider = \"magic\"\n", "Unknown embedding provider"),
            ("[vector]\nurl = \"x\"\n[embedding]\nprovider = \"openai\"\ndims = 8\n", "embedding.model"),
            ("[vector]\nurl = \"x\"\n[reasoning]\nprovider = \"openai\"\n", "reasoning.model"),
            ("[vector]\nurl = \"x\"\n[retrieval]\npattern_min_score = 2.0\n", "pattern_min_score"),
            ("[vector]\nurl = \"x\"\n[hierarchy]\noperator_groups = [\"[\"]\n", "hierarchy"),
        ];
        for (content, needle) in cases {
            let err = Config::from_toml_str(content).unwrap_err();
            assert!(
                format!("{:#}", err).contains(needle),
                "expected '{}' in error for {:?}, got {:#}",
                needle,
                content,
                err
            );
        }
    }

    #[test]
    fn test_disabled_providers_warn() {
        let cfg = Config::from_toml_str(MINIMAL).unwrap();
        let warnings = cfg.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("embedding.provider"));
        assert!(warnings[1].contains("reasoning.provider"));

        let content = r#"
[vector]
url = "http://localhost:6333"

[embedding]
provider = "hashing"
dims = 256

[reasoning]
provider = "openai"
model = "gpt-4o-mini"
"#;
        assert!(Config::from_toml_str(content).unwrap().warnings().is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.vector.url, "http://localhost:6333");
        assert!(load_config(Path::new("/definitely/not/here.toml")).is_err());
    }
}
