#![forbid(unsafe_code)]

//! # compliance-research
//!
//! Answers compliance questions ("which certifications do I need to export
//! honey to the US?") by running each user turn through a research pipeline:
//!
//! 1. an LLM router decides between a direct reply, a list-style plan and an
//!    open search plan;
//! 2. the restated question is expanded into 1–3 sub-queries;
//! 3. each sub-query is mapped onto a caller-supplied catalog of sources;
//! 4. every (sub-query, scope) pair is searched concurrently, each task
//!    isolated and bounded by its own timeout;
//! 5. the results are synthesized into one answer, optionally streamed.
//!
//! A persisted per-turn flag lets the user stop the pipeline at any
//! checkpoint. Every dispatched search is logged for audit.

pub mod config;
pub mod gateway;
pub mod prompts;
pub mod research;
pub mod search;
pub mod sources;
pub mod store;

pub use config::{PipelineConfig, ResearchConfig};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use research::{
    EventSink, ResearchDriver, ResearchError, ResearchEvent, SynthesisMode, TurnOutcome,
};
pub use search::{SearchProvider, SonarAdapter};
pub use sources::SourceDescriptor;
pub use store::{ConversationStore, SqliteConversationStore};
