//! Typed progress events emitted by the driver.
//!
//! The driver writes to an [`EventSink`]; transports (SSE, CLI) read the other
//! end. A dropped receiver never stalls or fails the pipeline.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::driver::{CancelledTurn, CompletedTurn, Stage};
use super::types::QueryMapping;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ResearchEvent {
    Status {
        stage: Stage,
        message: String,
    },
    RouterDecision {
        mode: &'static str,
        content: String,
    },
    ResearchQueries {
        queries: Vec<String>,
        mappings: Vec<QueryMapping>,
    },
    SummaryChunk {
        text: String,
    },
    Cancelled(CancelledTurn),
    Completed(CompletedTurn),
    Error {
        code: &'static str,
        message: String,
    },
}

impl ResearchEvent {
    pub fn status(stage: Stage, message: impl Into<String>) -> Self {
        Self::Status {
            stage,
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::RouterDecision { .. } => "router_decision",
            Self::ResearchQueries { .. } => "research_queries",
            Self::SummaryChunk { .. } => "summary_chunk",
            Self::Cancelled(_) => "cancelled",
            Self::Completed(_) => "completed",
            Self::Error { .. } => "error",
        }
    }

    /// True for the events that end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_) | Self::Completed(_) | Self::Error { .. }
        )
    }

    /// Server-sent-event frame: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null);
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

/// Write end of the event channel. `EventSink::none()` discards everything.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ResearchEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ResearchEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    /// Channel pair with the given buffer.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ResearchEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, event: ResearchEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                debug!("event receiver dropped");
            }
        }
    }
}
