//! Usage tracking via the UsageSink trait.
//!
//! The gateway reports every call through a UsageSink so the audit trail
//! does not depend on a storage backend:
//! - The CLI uses TracingUsageSink
//! - Tests use NoopUsageSink or RecordingUsageSink

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one outbound LLM call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub provider: &'static str,
    /// "chat/completions" or "chat/completions:stream".
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub session_id: Option<String>,
    pub turn_id: Option<String>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    /// Which pipeline stage made this call.
    pub caller: &'static str,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            session_id: None,
            turn_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn turn(mut self, turn_id: Option<String>) -> Self {
        self.turn_id = turn_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync + 'static {
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits one structured log event per call.
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, r: ProviderCallRecord) {
        match r.status {
            CallStatus::Success => tracing::info!(
                provider = r.provider,
                endpoint = r.endpoint,
                model = %r.model,
                caller = r.caller,
                turn_id = r.turn_id.as_deref().unwrap_or("-"),
                input_tokens = r.input_tokens,
                output_tokens = r.output_tokens,
                latency_ms = r.latency_ms,
                "llm call"
            ),
            CallStatus::Error => tracing::warn!(
                provider = r.provider,
                endpoint = r.endpoint,
                model = %r.model,
                caller = r.caller,
                turn_id = r.turn_id.as_deref().unwrap_or("-"),
                error = r.error_code.as_deref().unwrap_or("unknown"),
                latency_ms = r.latency_ms,
                "llm call failed"
            ),
        }
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct RecordingUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl RecordingUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProviderCallRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl UsageSink for RecordingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}
