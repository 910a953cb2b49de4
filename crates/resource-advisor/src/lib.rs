//! # Resource Advisor
//!
//! **Maps a free-text deployment intent to ranked, deployable sets of
//! Kubernetes resource types.**
//!
//! ## Architecture
//!
//! ```text
//! intent ──▶ Capability Store ─┐        ┌─▶ Pattern Store
//!            (vector search)   │        │   (vector search)
//!                              ▼        ▼
//!        ┌──────── Pass 1 ────────┐  ┌── Pass 2 ──┐
//!        │ select → resolve deps  │─▶│  enhance   │──▶ ranked solutions
//!        │ → rank                 │  │ (additive) │
//!        └────────────────────────┘  └────────────┘
//!               │          │
//!         kubectl schemas  reasoning service
//! ```
//!
//! 1. The **capability store** retrieves resource types whose descriptions
//!    resemble the intent; the **pattern store** retrieves organizational
//!    rules in parallel.
//! 2. The **reasoning service** selects up to five candidate solutions.
//! 3. The **dependency resolver** reads each member's schema from the
//!    cluster and appends any foundation dependency the selection missed.
//! 4. Candidates are ranked (reasoning score, semantic fit, completeness
//!    and hierarchy tier).
//! 5. Matched patterns may append companions to a candidate. Pass 2 never
//!    removes or reorders Pass 1 resources.
//!
//! The domain logic lives in [`resource_advisor_core`]; this crate adds
//! configuration, logging, the network collaborators and the
//! [`orchestrator`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run() -> anyhow::Result<()> {
//! use resource_advisor::{config::load_config, Advisor, RecommendOptions};
//!
//! let config = load_config(std::path::Path::new("config/advisor.toml"))?;
//! resource_advisor::logging::init(&config.logging)?;
//! let advisor = Advisor::from_config(&config)?;
//! let rec = advisor
//!     .recommend("PostgreSQL database in Azure", RecommendOptions::default())
//!     .await?;
//! for solution in &rec.solutions {
//!     println!("{:.0} {:?}", solution.score, solution.resources);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedding;
mod http;
pub mod kubectl;
pub mod logging;
pub mod orchestrator;
pub mod qdrant;
pub mod reasoning;

use std::sync::Arc;

use anyhow::Result;

use resource_advisor_core::reasoning::ReasoningService;

pub use orchestrator::{Advisor, Collaborators, RecommendOptions, Recommendation};

impl Collaborators {
    /// Build the production collaborators named by `config`.
    pub fn from_config(config: &config::Config) -> Result<Self> {
        for warning in config.warnings() {
            tracing::warn!(%warning, "configuration");
        }
        let reasoning: Arc<dyn ReasoningService> = match config.reasoning.provider.as_str() {
            "openai" => Arc::new(reasoning::OpenAIReasoning::new(&config.reasoning)?),
            _ => Arc::new(reasoning::DisabledReasoning),
        };
        Ok(Self {
            index: Arc::new(qdrant::QdrantIndex::new(&config.vector)?),
            embedder: embedding::create_provider(&config.embedding)?,
            reasoning,
            introspection: Arc::new(kubectl::KubectlIntrospection::new(&config.introspection)),
        })
    }
}

impl Advisor {
    /// Build an advisor with the production collaborators.
    pub fn from_config(config: &config::Config) -> Result<Self> {
        Advisor::new(Collaborators::from_config(config)?, config)
    }
}
