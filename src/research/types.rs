//! Shared value types for the research pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::QueryStatus;

/// Which research branch a non-direct turn takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Enumerate certifications / approvals; structured search output.
    List,
    /// Open question; cited prose output.
    Search,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Search => "search",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Self::List),
            "search" => Some(Self::Search),
            _ => None,
        }
    }

    /// Target sub-query range asked of the expander.
    pub fn expansion_range(self) -> (usize, usize) {
        match self {
            Self::List => (2, 3),
            Self::Search => (1, 2),
        }
    }
}

/// The classifier's single decision for a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RouterDecision {
    #[serde(rename = "list")]
    ListSearch { query: String },
    #[serde(rename = "search")]
    InternetSearch { query: String },
    Direct { reply: String },
}

impl RouterDecision {
    pub fn mode_label(&self) -> &'static str {
        match self {
            Self::ListSearch { .. } => "list",
            Self::InternetSearch { .. } => "search",
            Self::Direct { .. } => "direct",
        }
    }

    /// Restated query for research modes, reply text for direct.
    pub fn content(&self) -> &str {
        match self {
            Self::ListSearch { query } | Self::InternetSearch { query } => query,
            Self::Direct { reply } => reply,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Unscoped,
    Scoped,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unscoped => "unscoped",
            Self::Scoped => "scoped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unscoped" => Some(Self::Unscoped),
            "scoped" => Some(Self::Scoped),
            _ => None,
        }
    }
}

/// A sub-query paired with the catalog domains it should be searched on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMapping {
    pub query: String,
    pub sources: Vec<String>,
}

/// One unit of search work. Ephemeral; persisted only as a query log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchTask {
    pub query: String,
    /// Empty for unscoped tasks.
    pub scope: Vec<String>,
    pub kind: ScopeKind,
}

impl SearchTask {
    pub fn unscoped(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            scope: Vec::new(),
            kind: ScopeKind::Unscoped,
        }
    }

    pub fn scoped(query: impl Into<String>, scope: Vec<String>) -> Self {
        Self {
            query: query.into(),
            scope,
            kind: ScopeKind::Scoped,
        }
    }
}

/// One unscoped task per sub-query, then one scoped task per mapping with a
/// non-empty source subset.
pub fn build_tasks(queries: &[String], mappings: &[QueryMapping]) -> Vec<SearchTask> {
    let mut tasks: Vec<SearchTask> = queries.iter().map(SearchTask::unscoped).collect();
    tasks.extend(
        mappings
            .iter()
            .filter(|m| !m.sources.is_empty())
            .map(|m| SearchTask::scoped(m.query.clone(), m.sources.clone())),
    );
    tasks
}

/// Terminal state of one executed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
    Timeout,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl From<OutcomeStatus> for QueryStatus {
    fn from(s: OutcomeStatus) -> Self {
        match s {
            OutcomeStatus::Success => QueryStatus::Success,
            OutcomeStatus::Error => QueryStatus::Error,
            OutcomeStatus::Timeout => QueryStatus::Timeout,
        }
    }
}

/// Result of one task, positionally aligned with its input task.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub task: SearchTask,
    pub status: OutcomeStatus,
    /// Answer text on success, error text on error, empty on timeout.
    pub content: String,
    pub citations: Vec<String>,
    pub links: Vec<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Counts reported with a completed research turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_searches: usize,
    pub unscoped_searches: usize,
    pub scoped_searches: usize,
    pub succeeded: usize,
    pub errored: usize,
    pub timed_out: usize,
    pub elapsed_seconds: f64,
}

impl ExecutionSummary {
    pub fn from_outcomes(outcomes: &[SearchOutcome], elapsed: Duration) -> Self {
        let count = |f: &dyn Fn(&SearchOutcome) -> bool| outcomes.iter().filter(|o| f(o)).count();
        Self {
            total_searches: outcomes.len(),
            unscoped_searches: count(&|o| o.task.kind == ScopeKind::Unscoped),
            scoped_searches: count(&|o| o.task.kind == ScopeKind::Scoped),
            succeeded: count(&|o| o.status == OutcomeStatus::Success),
            errored: count(&|o| o.status == OutcomeStatus::Error),
            timed_out: count(&|o| o.status == OutcomeStatus::Timeout),
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }
}
