//! The research orchestration core.
//!
//! One [`ResearchDriver`] run per user turn:
//! classify → (direct reply) or (expand → map → search → synthesize),
//! with a cancellation checkpoint between every stage and after every
//! streamed chunk.

pub mod cancel;
pub mod classify;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod expand;
pub mod mapping;
pub mod synthesize;
pub mod types;

pub use cancel::{
    ensure_cancellation_notice, CancellationGate, INTERRUPTED_MARKER, NOTICE_TEXT, STOPPED_MARKER,
};
pub use driver::{CancelledTurn, CompletedTurn, ResearchDriver, Stage, TurnOutcome};
pub use error::{ClassificationFailure, ParseError, ResearchError};
pub use events::{EventSink, ResearchEvent};
pub use executor::{SearchExecutor, DEFAULT_TASK_TIMEOUT};
pub use synthesize::{SynthesisMode, Synthesizer};
pub use types::{
    build_tasks, ExecutionSummary, OutcomeStatus, QueryMapping, RouterDecision, ScopeKind,
    SearchMode, SearchOutcome, SearchTask,
};

/// Slice out the first balanced JSON object in noisy model output (code
/// fences, leading prose). `None` when there is no complete object.
pub(crate) fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let start = trimmed.find('{')?;
    let remainder = &trimmed[start..];
    find_matching_brace(remainder).map(|end| &remainder[..end])
}

/// Byte offset just past the brace closing the first `{`. Braces inside
/// JSON strings are ignored.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
