//! Parallel search execution with per-task failure isolation.
//!
//! All tasks of a batch are dispatched together and the stage waits for the
//! slowest one (or its timeout). Outcomes are returned in task order, one per
//! task, whatever mix of successes, errors and timeouts occurred.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::{stream, FutureExt, StreamExt};
use tracing::{info, warn};

use crate::gateway::Attribution;
use crate::prompts::search_prompt;
use crate::search::{extract_links, SearchProvider, SearchRequest};

use super::types::{OutcomeStatus, ScopeKind, SearchMode, SearchOutcome, SearchTask};

/// Per-task deadline.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SearchExecutor<'a> {
    provider: &'a dyn SearchProvider,
    task_timeout: Duration,
}

impl<'a> SearchExecutor<'a> {
    pub fn new(provider: &'a dyn SearchProvider) -> Self {
        Self {
            provider,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, task_timeout: Duration) -> Self {
        self.task_timeout = task_timeout;
        self
    }

    /// Run every task concurrently. `result.len() == tasks.len()` always, and
    /// `result[i]` belongs to `tasks[i]`.
    pub async fn execute(
        &self,
        tasks: &[SearchTask],
        mode: SearchMode,
        attribution: &Attribution,
    ) -> Vec<SearchOutcome> {
        if tasks.is_empty() {
            return Vec::new();
        }

        let started = Instant::now();
        let futs = tasks
            .iter()
            .cloned()
            .map(|task| self.run_task(task, mode, attribution.for_stage("research::search")));

        // `buffered` keeps input order; the width admits the whole batch at once.
        let outcomes: Vec<SearchOutcome> = stream::iter(futs).buffered(tasks.len()).collect().await;

        let count = |s: OutcomeStatus| outcomes.iter().filter(|o| o.status == s).count();
        info!(
            tasks = tasks.len(),
            succeeded = count(OutcomeStatus::Success),
            errored = count(OutcomeStatus::Error),
            timed_out = count(OutcomeStatus::Timeout),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search batch settled"
        );
        outcomes
    }

    async fn run_task(
        &self,
        task: SearchTask,
        mode: SearchMode,
        attribution: Attribution,
    ) -> SearchOutcome {
        let scoped = task.kind == ScopeKind::Scoped;
        let request = SearchRequest::new(task.query.clone(), search_prompt(mode, scoped))
            .scoped(task.scope.clone())
            .structured(mode == SearchMode::List)
            .attribution(attribution);

        let started = Instant::now();
        let call = AssertUnwindSafe(self.provider.search(request)).catch_unwind();
        let result = tokio::time::timeout(self.task_timeout, call).await;
        let elapsed = started.elapsed();

        let (status, content, citations) = match result {
            Ok(Ok(Ok(resp))) => (OutcomeStatus::Success, resp.content, resp.citations),
            Ok(Ok(Err(err))) if err.is_timeout() => (OutcomeStatus::Timeout, String::new(), Vec::new()),
            Ok(Ok(Err(err))) => {
                warn!(query = %task.query, kind = task.kind.as_str(), error = %err, "search task failed");
                (OutcomeStatus::Error, format!("Error: {err}"), Vec::new())
            }
            Ok(Err(_panic)) => {
                warn!(query = %task.query, kind = task.kind.as_str(), "search task panicked");
                (
                    OutcomeStatus::Error,
                    "Error: search task panicked".to_string(),
                    Vec::new(),
                )
            }
            Err(_) => {
                warn!(
                    query = %task.query,
                    kind = task.kind.as_str(),
                    timeout_ms = self.task_timeout.as_millis() as u64,
                    "search task timed out"
                );
                (OutcomeStatus::Timeout, String::new(), Vec::new())
            }
        };

        let links = if status == OutcomeStatus::Success {
            extract_links(&content)
        } else {
            Vec::new()
        };

        SearchOutcome {
            task,
            status,
            content,
            citations,
            links,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{SearchError, SearchResponse};
    use async_trait::async_trait;

    /// Behaviour keyed off the query text.
    struct ScriptedSearch;

    #[async_trait]
    impl SearchProvider for ScriptedSearch {
        async fn search(&self, req: SearchRequest) -> Result<SearchResponse, SearchError> {
            match req.query.as_str() {
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("timeout fires first")
                }
                "fail" => Err(SearchError::Status {
                    status: 500,
                    message: "upstream down".into(),
                }),
                "panic" => panic!("provider bug"),
                q => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(SearchResponse {
                        content: format!("{q} see https://fda.gov/x and https://fda.gov/x"),
                        citations: vec![format!("https://{}.example", req.domains.len())],
                    })
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_failures_still_yield_one_outcome_per_task_in_order() {
        let provider = ScriptedSearch;
        let exec = SearchExecutor::new(&provider);
        let tasks = vec![
            SearchTask::unscoped("ok"),
            SearchTask::unscoped("fail"),
            SearchTask::scoped("slow", vec!["fda.gov".into()]),
            SearchTask::scoped("panic", vec!["cbp.gov".into()]),
            SearchTask::scoped("ok", vec!["fda.gov".into(), "cbp.gov".into()]),
        ];

        let out = exec
            .execute(&tasks, SearchMode::Search, &Attribution::new("test"))
            .await;

        assert_eq!(out.len(), tasks.len());
        for (o, t) in out.iter().zip(&tasks) {
            assert_eq!(&o.task, t);
        }
        assert_eq!(out[0].status, OutcomeStatus::Success);
        assert_eq!(out[0].links, vec!["https://fda.gov/x".to_string()]);
        assert_eq!(out[1].status, OutcomeStatus::Error);
        assert!(out[1].content.contains("upstream down"));
        assert_eq!(out[2].status, OutcomeStatus::Timeout);
        assert!(out[2].content.is_empty());
        assert_eq!(out[3].status, OutcomeStatus::Error);
        assert_eq!(out[4].status, OutcomeStatus::Success);
        assert_eq!(out[4].citations, vec!["https://2.example".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_bounded_by_the_slowest_task() {
        let provider = ScriptedSearch;
        let exec = SearchExecutor::new(&provider);
        let tasks = vec![
            SearchTask::unscoped("a"),
            SearchTask::unscoped("slow"),
            SearchTask::unscoped("b"),
            SearchTask::unscoped("c"),
        ];

        let started = tokio::time::Instant::now();
        let out = exec
            .execute(&tasks, SearchMode::List, &Attribution::new("test"))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(out.len(), 4);
        assert_eq!(
            out.iter()
                .filter(|o| o.status == OutcomeStatus::Timeout)
                .count(),
            1
        );
        assert!(elapsed >= DEFAULT_TASK_TIMEOUT);
        assert!(elapsed < DEFAULT_TASK_TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let provider = ScriptedSearch;
        let out = SearchExecutor::new(&provider)
            .execute(&[], SearchMode::Search, &Attribution::new("test"))
            .await;
        assert!(out.is_empty());
    }
}
