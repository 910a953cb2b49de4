//! Error taxonomy surfaced to callers of the recommendation pipeline.
//!
//! Collaborator failures (HTTP, kubectl, JSON) never cross the public
//! boundary as-is; the orchestrator maps them onto [`AdvisorError`]. Only
//! Pass 1 failures and invalid requests are returned as `Err`. The other
//! variants are rendered into warnings and the response's `degraded` flag.

use std::fmt;

use crate::models::ResourceIdentifier;

/// Pipeline stage, used for error context and state-machine logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    RetrievingCapabilities,
    SelectingCandidates,
    ResolvingDependencies,
    RankingPass1,
    RetrievingPatterns,
    EnhancingPass2,
    Done,
    Error,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::RetrievingCapabilities => "retrieving-capabilities",
            Stage::SelectingCandidates => "selecting-candidates",
            Stage::ResolvingDependencies => "resolving-dependencies",
            Stage::RankingPass1 => "ranking-pass1",
            Stage::RetrievingPatterns => "retrieving-patterns",
            Stage::EnhancingPass2 => "enhancing-pass2",
            Stage::Done => "done",
            Stage::Error => "error",
        };
        f.write_str(name)
    }
}

/// Top-level error enum for the recommendation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Retrieval degraded ({collection}): {reason}")]
    RetrievalDegraded { collection: String, reason: String },

    #[error("Schema unavailable for {id}: {reason}")]
    SchemaUnavailable {
        id: ResourceIdentifier,
        reason: String,
    },

    #[error("Reasoning response failed validation during {stage}: {reason}")]
    ReasoningParse { stage: Stage, reason: String },

    #[error("Solution {solution} violated the additive-only contract: {reason}")]
    ContractViolation { solution: String, reason: String },

    #[error("Request deadline exceeded during {stage}")]
    DeadlineExceeded { stage: Stage },
}

pub type AdvisorResult<T> = Result<T, AdvisorError>;
