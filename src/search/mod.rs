//! Web search provider seam.
//!
//! The executor only sees [`SearchProvider`]; [`SonarAdapter`] is the HTTP
//! implementation used by the binary.

pub mod links;
pub mod sonar;

use async_trait::async_trait;
use thiserror::Error;

use crate::gateway::Attribution;

pub use links::extract_links;
pub use sonar::SonarAdapter;

/// One outbound search call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    /// Bare domains the search is restricted to. Empty means the open web.
    pub domains: Vec<String>,
    /// System instructions for the search model.
    pub prompt: String,
    /// Ask for the certification-record schema instead of prose.
    pub structured: bool,
    pub attribution: Attribution,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            domains: Vec::new(),
            prompt: prompt.into(),
            structured: false,
            attribution: Attribution::new("search"),
        }
    }

    pub fn scoped(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    pub fn structured(mut self, structured: bool) -> Self {
        self.structured = structured;
        self
    }

    pub fn attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = attribution;
        self
    }
}

/// Answer text plus the provider's citation list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResponse {
    pub content: String,
    pub citations: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search rate limited")]
    RateLimited,

    #[error("search provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed search response: {0}")]
    Malformed(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SearchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SearchError::Http(e) if e.is_timeout())
    }
}

/// Must be callable concurrently; the executor issues every task at once.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, req: SearchRequest) -> Result<SearchResponse, SearchError>;
}
