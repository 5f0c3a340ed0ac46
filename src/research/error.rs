//! Error taxonomy for the research pipeline.
//!
//! Only classification and synthesis failures end a turn with an error.
//! Expansion, mapping and individual search failures are absorbed by their
//! stage and never reach this level.

use std::time::Duration;

use thiserror::Error;

use crate::gateway::ProviderError;
use crate::store::StoreError;

/// Structured-output parse failures from the expander and mapper.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no JSON object in model output")]
    NoJson,

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("empty result")]
    Empty,

    #[error("expected {expected} entries, got {got}")]
    Cardinality { expected: usize, got: usize },

    #[error("model call failed: {0}")]
    Call(#[from] ProviderError),
}

/// Why the classifier produced no decision.
#[derive(Debug, Error)]
pub enum ClassificationFailure {
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("classification call failed: {0}")]
    Transport(#[from] ProviderError),

    #[error("unusable classifier output: {0}")]
    Malformed(String),
}

/// Terminal, caller-visible failure of one turn.
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error(transparent)]
    Classification(#[from] ClassificationFailure),

    #[error("synthesis failed: {0}")]
    Synthesis(#[source] ProviderError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ResearchError {
    /// Short machine-readable code for `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Classification(_) => "classification_failed",
            Self::Synthesis(_) => "synthesis_failed",
            Self::Store(_) => "store_error",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}
