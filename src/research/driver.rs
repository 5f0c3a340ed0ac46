//! Per-turn state machine.
//!
//! ```text
//! Received → Classifying → Responding                                   → Completed
//!                        → Expanding → Mapping → Searching → Synthesizing → Completed
//! (any state but Completed) → Cancelled
//! ```
//!
//! The cancellation flag is re-read before classifying, expanding, mapping,
//! searching and synthesizing, and after every streamed chunk. Before any
//! assistant output exists a cancellation leaves one notice turn; after it,
//! the partial text is persisted with a marker.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::gateway::{Attribution, ChatGateway, Message, ProviderError};
use crate::search::SearchProvider;
use crate::sources::{catalog_fingerprint, catalog_snapshot, SourceDescriptor};
use crate::store::{
    ConversationStore, NewQueryLog, NewResearchRequest, NewTurn, RequestStatus, ResearchRequest,
    StoreError, Turn, TurnKind,
};

use super::cancel::{
    ensure_cancellation_notice, persist_partial, CancellationGate, INTERRUPTED_MARKER,
    STOPPED_MARKER,
};
use super::classify::classify;
use super::error::ResearchError;
use super::events::{EventSink, ResearchEvent};
use super::executor::SearchExecutor;
use super::expand::expand_queries;
use super::mapping::map_sources;
use super::synthesize::{SynthesisMode, Synthesizer};
use super::types::{build_tasks, ExecutionSummary, RouterDecision, SearchMode, SearchOutcome};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Received,
    Classifying,
    Responding,
    Expanding,
    Mapping,
    Searching,
    Synthesizing,
    Completed,
    Cancelled,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classifying => "classifying",
            Self::Responding => "responding",
            Self::Expanding => "expanding",
            Self::Mapping => "mapping",
            Self::Searching => "searching",
            Self::Synthesizing => "synthesizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Final result of a turn that ran to completion.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedTurn {
    pub turn_id: String,
    pub session_id: String,
    pub assistant_turn_id: String,
    /// `direct`, `list` or `search`.
    pub mode: &'static str,
    pub answer: String,
    pub request_id: Option<String>,
    pub queries: Vec<String>,
    pub summary: Option<ExecutionSummary>,
    pub results: Vec<SearchOutcome>,
}

/// Final result of a turn stopped by the user.
#[derive(Debug, Clone, Serialize)]
pub struct CancelledTurn {
    pub turn_id: String,
    pub session_id: String,
    /// Checkpoint at which the flag was observed.
    pub stage: Stage,
    pub request_id: Option<String>,
    /// Set when no output had been produced yet.
    pub notice_turn_id: Option<String>,
    /// Set when partial streamed text was persisted instead.
    pub partial_turn_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed(CompletedTurn),
    Cancelled(CancelledTurn),
}

impl TurnOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn completed(&self) -> Option<&CompletedTurn> {
        match self {
            Self::Completed(c) => Some(c),
            Self::Cancelled(_) => None,
        }
    }

    pub fn cancelled(&self) -> Option<&CancelledTurn> {
        match self {
            Self::Cancelled(c) => Some(c),
            Self::Completed(_) => None,
        }
    }

    fn into_event(self) -> ResearchEvent {
        match self {
            Self::Completed(c) => ResearchEvent::Completed(c),
            Self::Cancelled(c) => ResearchEvent::Cancelled(c),
        }
    }
}

/// Everything one research-mode turn carries between stages.
struct ResearchRun<'a> {
    turn: &'a Turn,
    request: ResearchRequest,
    mode: SearchMode,
    restated: String,
    context: Vec<Message>,
    started: Instant,
}

// =============================================================================
// Driver
// =============================================================================

/// Sequences the stages for one turn at a time. Holds no per-turn state, so a
/// single driver can serve many turns concurrently.
pub struct ResearchDriver {
    gateway: Arc<dyn ChatGateway>,
    search: Arc<dyn SearchProvider>,
    store: Arc<dyn ConversationStore>,
    config: PipelineConfig,
}

impl ResearchDriver {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        search: Arc<dyn SearchProvider>,
        store: Arc<dyn ConversationStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            gateway,
            search,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Persist an incoming user message as a new turn.
    pub async fn accept_message(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<Turn, ResearchError> {
        if session_id.trim().is_empty() {
            return Err(ResearchError::InvalidRequest("session id is empty".into()));
        }
        let content = content.trim();
        if content.is_empty() {
            return Err(ResearchError::InvalidRequest("message is empty".into()));
        }
        Ok(self.store.append_turn(NewTurn::user(session_id, content)).await?)
    }

    /// Accept a message and run the pipeline for it.
    pub async fn ask(
        &self,
        session_id: &str,
        content: &str,
        catalog: &[SourceDescriptor],
        synthesis: SynthesisMode,
        events: &EventSink,
    ) -> Result<TurnOutcome, ResearchError> {
        let turn = match self.accept_message(session_id, content).await {
            Ok(turn) => turn,
            Err(err) => {
                events
                    .emit(ResearchEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
        };
        self.run(&turn, catalog, synthesis, events).await
    }

    /// Flip the cancellation flag of a turn. A running pipeline observes it at
    /// its next checkpoint. Returns `false` if the turn was already cancelled.
    pub async fn cancel(&self, turn_id: &str, reason: &str) -> Result<bool, ResearchError> {
        let flipped = self.store.mark_cancelled(turn_id, reason).await?;
        info!(turn_id, flipped, "cancellation requested");
        Ok(flipped)
    }

    pub async fn cancel_session(&self, session_id: &str, reason: &str) -> Result<usize, ResearchError> {
        let count = self.store.cancel_session(session_id, reason).await?;
        info!(session_id, count, "session cancellation requested");
        Ok(count)
    }

    /// Run the pipeline for an already persisted user turn. Always emits
    /// exactly one terminal event (`completed`, `cancelled` or `error`).
    pub async fn run(
        &self,
        turn: &Turn,
        catalog: &[SourceDescriptor],
        synthesis: SynthesisMode,
        events: &EventSink,
    ) -> Result<TurnOutcome, ResearchError> {
        let started = Instant::now();
        events
            .emit(ResearchEvent::status(Stage::Received, "Message received"))
            .await;

        match self.drive(turn, catalog, synthesis, events, started).await {
            Ok(outcome) => {
                info!(
                    turn_id = %turn.id,
                    cancelled = outcome.is_cancelled(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "turn finished"
                );
                events.emit(outcome.clone().into_event()).await;
                Ok(outcome)
            }
            Err(err) => {
                warn!(turn_id = %turn.id, code = err.code(), error = %err, "turn failed");
                events
                    .emit(ResearchEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        turn: &Turn,
        catalog: &[SourceDescriptor],
        synthesis: SynthesisMode,
        events: &EventSink,
        started: Instant,
    ) -> Result<TurnOutcome, ResearchError> {
        let gate = CancellationGate::new(self.store.as_ref(), &turn.id);
        let attribution = self.attribution(turn);

        if gate.is_cancelled(Stage::Classifying).await? {
            return self.stop_before_output(turn, Stage::Classifying, None).await;
        }
        events
            .emit(ResearchEvent::status(Stage::Classifying, "Understanding your question"))
            .await;

        let context = self.context_for(turn).await?;
        let decision = classify(
            self.gateway.as_ref(),
            &self.config.router_model,
            &context,
            self.config.classify_timeout(),
            attribution.for_stage("research::classify"),
        )
        .await?;

        events
            .emit(ResearchEvent::RouterDecision {
                mode: decision.mode_label(),
                content: decision.content().to_string(),
            })
            .await;

        let (mode, restated) = match decision {
            RouterDecision::Direct { reply } => {
                return self.respond_directly(turn, &gate, reply, synthesis, events).await;
            }
            RouterDecision::ListSearch { query } => (SearchMode::List, query),
            RouterDecision::InternetSearch { query } => (SearchMode::Search, query),
        };

        let snapshot = catalog_snapshot(catalog).map_err(StoreError::from)?;
        let request = self
            .store
            .create_research_request(NewResearchRequest {
                session_id: turn.session_id.clone(),
                turn_id: turn.id.clone(),
                enhanced_query: restated.clone(),
                mode,
                catalog_hash: catalog_fingerprint(&snapshot),
                catalog_snapshot: snapshot,
            })
            .await?;
        info!(
            turn_id = %turn.id,
            request_id = %request.id,
            mode = mode.as_str(),
            sources = catalog.len(),
            "research request created"
        );

        let request_id = request.id.clone();
        let run = ResearchRun {
            turn,
            request,
            mode,
            restated,
            context,
            started,
        };
        match self.research(&run, &gate, catalog, synthesis, events).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(store_err) = self
                    .finish_request(&request_id, RequestStatus::Failed, started)
                    .await
                {
                    warn!(request_id = %request_id, error = %store_err, "could not mark request failed");
                }
                Err(err)
            }
        }
    }

    async fn respond_directly(
        &self,
        turn: &Turn,
        gate: &CancellationGate<'_>,
        reply: String,
        synthesis: SynthesisMode,
        events: &EventSink,
    ) -> Result<TurnOutcome, ResearchError> {
        if gate.is_cancelled(Stage::Responding).await? {
            return self.stop_before_output(turn, Stage::Responding, None).await;
        }
        if synthesis == SynthesisMode::Streaming {
            events
                .emit(ResearchEvent::SummaryChunk {
                    text: reply.clone(),
                })
                .await;
        }
        let saved = self
            .store
            .append_turn(NewTurn::assistant_reply(
                &turn.session_id,
                &turn.id,
                reply.as_str(),
                TurnKind::Text,
            ))
            .await?;
        Ok(TurnOutcome::Completed(CompletedTurn {
            turn_id: turn.id.clone(),
            session_id: turn.session_id.clone(),
            assistant_turn_id: saved.id,
            mode: "direct",
            answer: reply,
            request_id: None,
            queries: Vec::new(),
            summary: None,
            results: Vec::new(),
        }))
    }

    async fn research(
        &self,
        run: &ResearchRun<'_>,
        gate: &CancellationGate<'_>,
        catalog: &[SourceDescriptor],
        synthesis: SynthesisMode,
        events: &EventSink,
    ) -> Result<TurnOutcome, ResearchError> {
        let turn = run.turn;
        let attribution = self.attribution(turn);

        // ---------------------------------------------------------------------
        // Expanding
        // ---------------------------------------------------------------------
        if gate.is_cancelled(Stage::Expanding).await? {
            return self.abandon(run, Stage::Expanding).await;
        }
        events
            .emit(ResearchEvent::status(Stage::Expanding, "Breaking the question into searches"))
            .await;
        let queries = expand_queries(
            self.gateway.as_ref(),
            &self.config.planner_model,
            run.mode,
            &run.restated,
            self.config.max_sub_queries,
            attribution.for_stage("research::expand"),
        )
        .await;

        // ---------------------------------------------------------------------
        // Mapping
        // ---------------------------------------------------------------------
        if gate.is_cancelled(Stage::Mapping).await? {
            return self.abandon(run, Stage::Mapping).await;
        }
        events
            .emit(ResearchEvent::status(Stage::Mapping, "Choosing sources"))
            .await;
        let mappings = map_sources(
            self.gateway.as_ref(),
            &self.config.planner_model,
            &queries,
            catalog,
            attribution.for_stage("research::map"),
        )
        .await;
        events
            .emit(ResearchEvent::ResearchQueries {
                queries: queries.clone(),
                mappings: mappings.clone(),
            })
            .await;

        // ---------------------------------------------------------------------
        // Searching
        // ---------------------------------------------------------------------
        if gate.is_cancelled(Stage::Searching).await? {
            return self.abandon(run, Stage::Searching).await;
        }
        let tasks = build_tasks(&queries, &mappings);
        events
            .emit(ResearchEvent::status(
                Stage::Searching,
                format!("Running {} searches", tasks.len()),
            ))
            .await;

        let mut log_ids = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let log = self
                .store
                .append_query_log(NewQueryLog {
                    request_id: run.request.id.clone(),
                    task_index: index as i64,
                    query_text: task.query.clone(),
                    scope_kind: task.kind,
                    source_subset: task.scope.clone(),
                })
                .await?;
            log_ids.push(log.id);
        }

        let search_started = Instant::now();
        let outcomes = SearchExecutor::new(self.search.as_ref())
            .with_timeout(self.config.search_timeout())
            .execute(&tasks, run.mode, &attribution)
            .await;
        let summary = ExecutionSummary::from_outcomes(&outcomes, search_started.elapsed());

        // Every row gets its terminal status even if an earlier write failed.
        let mut first_err = None;
        for (log_id, outcome) in log_ids.iter().zip(&outcomes) {
            if let Err(err) = self
                .store
                .update_query_log_result(
                    log_id,
                    outcome.status.into(),
                    &outcome.content,
                    &outcome.citations,
                )
                .await
            {
                warn!(request_id = %run.request.id, log_id = %log_id, error = %err, "could not record search result");
                first_err.get_or_insert(err);
            }
        }
        if let Some(err) = first_err {
            return Err(err.into());
        }
        info!(
            request_id = %run.request.id,
            tasks = summary.total_searches,
            succeeded = summary.succeeded,
            errored = summary.errored,
            timed_out = summary.timed_out,
            "search results logged"
        );

        // ---------------------------------------------------------------------
        // Synthesizing
        // ---------------------------------------------------------------------
        if gate.is_cancelled(Stage::Synthesizing).await? {
            return self.abandon(run, Stage::Synthesizing).await;
        }
        events
            .emit(ResearchEvent::status(Stage::Synthesizing, "Writing the answer"))
            .await;

        let synthesizer = Synthesizer::new(self.gateway.as_ref(), &self.config.synthesis_model);
        let synth_attribution = attribution.for_stage("research::synthesize");
        let answer = match synthesis {
            SynthesisMode::Batch => {
                let answer = synthesizer
                    .batch(&run.context, &run.restated, &outcomes, synth_attribution)
                    .await
                    .map_err(ResearchError::Synthesis)?;
                // Nothing has reached the caller yet, so a late stop still
                // ends with a notice rather than the answer.
                if gate.is_cancelled(Stage::Synthesizing).await? {
                    return self.abandon(run, Stage::Synthesizing).await;
                }
                answer
            }
            SynthesisMode::Streaming => {
                let mut stream = synthesizer
                    .stream(&run.context, &run.restated, &outcomes, synth_attribution)
                    .await
                    .map_err(ResearchError::Synthesis)?;
                let mut answer = String::new();
                while let Some(chunk) = stream.next().await {
                    let text = match chunk {
                        Ok(text) => text,
                        Err(err) => return self.interrupted(run, &answer, err).await,
                    };
                    if text.is_empty() {
                        continue;
                    }
                    answer.push_str(&text);
                    events.emit(ResearchEvent::SummaryChunk { text }).await;

                    if gate.is_cancelled(Stage::Synthesizing).await? {
                        return self.stop_mid_stream(run, &answer).await;
                    }
                }
                if answer.trim().is_empty() {
                    return Err(ResearchError::Synthesis(ProviderError::provider(
                        "synthesis",
                        "empty answer",
                    )));
                }
                answer
            }
        };

        let saved = self
            .store
            .append_turn(NewTurn::assistant_reply(
                &turn.session_id,
                &turn.id,
                answer.as_str(),
                TurnKind::Text,
            ))
            .await?;
        self.finish_request(&run.request.id, RequestStatus::Completed, run.started)
            .await?;

        Ok(TurnOutcome::Completed(CompletedTurn {
            turn_id: turn.id.clone(),
            session_id: turn.session_id.clone(),
            assistant_turn_id: saved.id,
            mode: run.mode.as_str(),
            answer,
            request_id: Some(run.request.id.clone()),
            queries,
            summary: Some(summary),
            results: outcomes,
        }))
    }

    // =========================================================================
    // Terminal paths
    // =========================================================================

    /// Cancellation observed before any assistant output: one notice turn.
    async fn stop_before_output(
        &self,
        turn: &Turn,
        stage: Stage,
        request_id: Option<String>,
    ) -> Result<TurnOutcome, ResearchError> {
        let notice = ensure_cancellation_notice(self.store.as_ref(), turn).await?;
        info!(turn_id = %turn.id, stage = stage.as_str(), notice_id = %notice.id, "turn cancelled");
        Ok(TurnOutcome::Cancelled(CancelledTurn {
            turn_id: turn.id.clone(),
            session_id: turn.session_id.clone(),
            stage,
            request_id,
            notice_turn_id: Some(notice.id),
            partial_turn_id: None,
        }))
    }

    /// Cancellation observed inside the research branch before output.
    async fn abandon(
        &self,
        run: &ResearchRun<'_>,
        stage: Stage,
    ) -> Result<TurnOutcome, ResearchError> {
        self.finish_request(&run.request.id, RequestStatus::Cancelled, run.started)
            .await?;
        self.stop_before_output(run.turn, stage, Some(run.request.id.clone()))
            .await
    }

    /// Cancellation observed after chunks were already delivered.
    async fn stop_mid_stream(
        &self,
        run: &ResearchRun<'_>,
        partial: &str,
    ) -> Result<TurnOutcome, ResearchError> {
        let saved = persist_partial(self.store.as_ref(), run.turn, partial, STOPPED_MARKER).await?;
        self.finish_request(&run.request.id, RequestStatus::Cancelled, run.started)
            .await?;
        info!(
            turn_id = %run.turn.id,
            partial_chars = partial.chars().count(),
            "stream stopped by user; partial answer kept"
        );
        Ok(TurnOutcome::Cancelled(CancelledTurn {
            turn_id: run.turn.id.clone(),
            session_id: run.turn.session_id.clone(),
            stage: Stage::Synthesizing,
            request_id: Some(run.request.id.clone()),
            notice_turn_id: None,
            partial_turn_id: Some(saved.id),
        }))
    }

    /// Stream failed mid-way. Whatever was delivered is kept, then the turn
    /// fails.
    async fn interrupted(
        &self,
        run: &ResearchRun<'_>,
        partial: &str,
        err: ProviderError,
    ) -> Result<TurnOutcome, ResearchError> {
        if !partial.is_empty() {
            let saved =
                persist_partial(self.store.as_ref(), run.turn, partial, INTERRUPTED_MARKER).await?;
            warn!(turn_id = %run.turn.id, partial_turn_id = %saved.id, "stream interrupted; partial answer kept");
        }
        Err(ResearchError::Synthesis(err))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn attribution(&self, turn: &Turn) -> Attribution {
        Attribution::new("research")
            .with_session(turn.session_id.as_str())
            .with_turn(turn.id.as_str())
    }

    /// Recent turns as role+content messages, ending with `turn` itself.
    /// Turns appended after `turn` never enter its context.
    async fn context_for(&self, turn: &Turn) -> Result<Vec<Message>, StoreError> {
        let earlier = self.config.context_turns.saturating_sub(1);
        let mut messages: Vec<Message> = if earlier == 0 {
            Vec::new()
        } else {
            self.store
                .recent_turns(&turn.session_id, turn.order - 1, earlier)
                .await?
                .into_iter()
                .map(|t| Message {
                    role: t.role,
                    content: t.content,
                })
                .collect()
        };
        messages.push(Message {
            role: turn.role,
            content: turn.content.clone(),
        });
        Ok(messages)
    }

    async fn finish_request(
        &self,
        request_id: &str,
        status: RequestStatus,
        started: Instant,
    ) -> Result<(), StoreError> {
        let moved = self
            .store
            .update_research_request_status(
                request_id,
                status,
                Some(started.elapsed().as_secs_f64()),
            )
            .await?;
        if moved {
            debug!(request_id, status = status.as_str(), "research request finished");
        } else {
            debug!(request_id, status = status.as_str(), "research request already terminal");
        }
        Ok(())
    }
}
