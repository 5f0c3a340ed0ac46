//! Provider gateway for OpenAI-compatible chat completions.

pub mod completions;
pub mod error;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use completions::ChatProvider;
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use completions::ChatCompletionsAdapter;
pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, RecordingUsageSink, TracingUsageSink, UsageSink};

const PROVIDER_LABEL: &str = "chat_completions";

/// The seam every pipeline stage talks to. Implemented by [`ProviderGateway`]
/// and by scripted fakes in tests.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;

    async fn chat_stream(&self, req: ChatRequest) -> Result<ChatChunkStream, ProviderError>;
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Upper bound on a whole non-streaming call, on top of the HTTP timeout.
    pub call_timeout: Option<Duration>,
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    adapter: ChatCompletionsAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<ChatChunkStream, ProviderError> {
        ProviderGateway::chat_stream(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn with_config(
        adapter: ChatCompletionsAdapter,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapter,
            usage_sink,
            config,
        }
    }

    /// Single attempt; callers own their fallback policy.
    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let result = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.adapter.chat(&req)).await {
                Ok(r) => r,
                Err(_) => Err(ProviderError::Timeout(limit)),
            },
            None => self.adapter.chat(&req).await,
        };

        match result {
            Ok(resp) => {
                self.record_usage(&req, "chat/completions", &resp, None).await;
                Ok(resp)
            }
            Err(err) => {
                self.record_usage(
                    &req,
                    "chat/completions",
                    &ChatResponse::empty(),
                    Some(err.code()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Opens the stream and records one usage entry once the provider
    /// finishes or fails mid-stream.
    pub async fn chat_stream(&self, req: ChatRequest) -> Result<ChatChunkStream, ProviderError> {
        let started = std::time::Instant::now();
        let inner = match self.adapter.chat_stream(&req).await {
            Ok(s) => s,
            Err(err) => {
                self.record_usage(
                    &req,
                    "chat/completions:stream",
                    &ChatResponse::empty(),
                    Some(err.code()),
                )
                .await;
                return Err(err);
            }
        };

        let sink = Arc::clone(&self.usage_sink);
        let base = ProviderCallRecord::new(
            PROVIDER_LABEL,
            "chat/completions:stream",
            req.model.clone(),
            req.attribution.caller,
        )
        .session(req.attribution.session_id.clone())
        .turn(req.attribution.turn_id.clone());

        let audited = futures::stream::unfold(
            (inner, Some((sink, base))),
            move |(mut inner, mut audit)| async move {
                let item = inner.next().await;
                let finished = match &item {
                    None => Some(None),
                    Some(Err(e)) => Some(Some(e.code())),
                    Some(Ok(_)) => None,
                };
                if let (Some(error_code), Some((sink, base))) = (finished, audit.take()) {
                    let record = base.latency(started.elapsed().as_millis() as u64);
                    let record = match error_code {
                        Some(code) => record.error(code),
                        None => record,
                    };
                    sink.record(record).await;
                }
                item.map(|i| (i, (inner, audit)))
            },
        );

        Ok(Box::pin(audited))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        endpoint: &'static str,
        resp: &ChatResponse,
        error_code: Option<&'static str>,
    ) {
        let record = ProviderCallRecord::new(
            PROVIDER_LABEL,
            endpoint,
            req.model.clone(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .session(req.attribution.session_id.clone())
        .turn(req.attribution.turn_id.clone())
        .latency(resp.latency.as_millis() as u64);

        let record = match error_code {
            Some(code) => record.error(code),
            None => record,
        };

        self.usage_sink.record(record).await;
    }
}
