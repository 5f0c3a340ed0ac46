//! Adapter for OpenAI-compatible `/chat/completions` endpoints.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Open an incremental response channel. Errors before the first byte are
    /// returned directly; later failures arrive as stream items.
    async fn chat_stream(&self, req: &ChatRequest) -> Result<ChatChunkStream, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

const PROVIDER: &str = "chat_completions";

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

#[derive(Debug, Clone)]
pub struct ChatCompletionsAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl ChatCompletionsAdapter {
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn validate(req: &ChatRequest) -> Result<(), ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }
        Ok(())
    }

    async fn send(
        &self,
        req: &ChatRequest,
        stream: bool,
    ) -> Result<(reqwest::Response, ErrorContext), ProviderError> {
        Self::validate(req)?;

        let messages: Vec<ApiMessage> = req.messages.iter().map(ApiMessage::from).collect();
        let tools: Vec<ApiTool> = req.tools.iter().map(ApiTool::from).collect();

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
            tool_choice: (!tools.is_empty()).then_some("auto"),
            tools: (!tools.is_empty()).then_some(tools),
            stream,
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match Self::extract_request_id(response.headers()) {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body, ctx));
        }

        Ok((response, ctx))
    }
}

/// Map a non-2xx body to a typed error.
fn error_from_body(status: u16, body: &str, ctx: ErrorContext) -> ProviderError {
    let parsed = serde_json::from_str::<ChatApiResponse>(body)
        .ok()
        .and_then(|p| p.error);

    let (message, ctx) = match parsed {
        Some(error) => {
            let ctx = match error.code {
                Some(code) => ctx.with_code(code),
                None => ctx,
            };
            (error.message.unwrap_or_default(), ctx)
        }
        None => (format!("HTTP {status}"), ctx),
    };

    match status {
        429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
        400 => ProviderError::InvalidRequest {
            message,
            context: Some(ctx),
        },
        _ => ProviderError::provider_with_context(PROVIDER, message, ctx),
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role.as_str(),
            content: m.content.clone(),
        }
    }
}

#[derive(Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunction,
}

#[derive(Serialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolSpec> for ApiTool {
    fn from(t: &ToolSpec) -> Self {
        Self {
            tool_type: "function",
            function: ApiFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    function: Option<ApiToolFunction>,
}

#[derive(Deserialize)]
struct ApiToolFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for ChatCompletionsAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let (mut response, _ctx) = self.send(req, false).await?;

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    PROVIDER,
                    format!("Response too large: {new_len} bytes"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes);
        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(PROVIDER, format!("Invalid JSON: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider(
                PROVIDER,
                error.message.unwrap_or_default(),
            ));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider(PROVIDER, "No choices in response"))?;

        let (content, tool_calls) = match choice.message {
            Some(m) => {
                let calls = m
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tc| tc.function)
                    .filter_map(|f| {
                        Some(ToolCall {
                            name: f.name?,
                            arguments: f.arguments.unwrap_or_else(|| "{}".to_string()),
                        })
                    })
                    .collect();
                (m.content.unwrap_or_default(), calls)
            }
            None => (String::new(), Vec::new()),
        };

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            tool_calls,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }

    async fn chat_stream(&self, req: &ChatRequest) -> Result<ChatChunkStream, ProviderError> {
        let (response, _ctx) = self.send(req, true).await?;

        let body: ByteStream = Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        let state = DeltaStreamState {
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            error: None,
            done: false,
        };

        Ok(Box::pin(futures::stream::unfold(state, next_delta)))
    }
}

// =============================================================================
// STREAMING
// =============================================================================

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

struct DeltaStreamState {
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    error: Option<ProviderError>,
    done: bool,
}

async fn next_delta(
    mut st: DeltaStreamState,
) -> Option<(Result<String, ProviderError>, DeltaStreamState)> {
    loop {
        if let Some(delta) = st.pending.pop_front() {
            return Some((Ok(delta), st));
        }
        if let Some(err) = st.error.take() {
            return Some((Err(err), st));
        }
        if st.done {
            return None;
        }

        let payloads = match st.body.next().await {
            Some(Ok(bytes)) => st.decoder.push(&bytes),
            Some(Err(e)) => {
                st.done = true;
                st.error = Some(ProviderError::Http(e));
                continue;
            }
            None => {
                st.done = true;
                st.decoder.finish()
            }
        };

        for payload in payloads {
            match parse_stream_payload(&payload) {
                Ok(StreamPayload::Delta(text)) => st.pending.push_back(text),
                Ok(StreamPayload::Skip) => {}
                Ok(StreamPayload::Done) => {
                    st.done = true;
                    break;
                }
                Err(e) => {
                    st.done = true;
                    st.error = Some(e);
                    break;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StreamPayload {
    Delta(String),
    Skip,
    Done,
}

fn parse_stream_payload(payload: &str) -> Result<StreamPayload, ProviderError> {
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(StreamPayload::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| ProviderError::provider(PROVIDER, format!("Invalid stream chunk: {e}")))?;
    if let Some(error) = chunk.error {
        return Err(ProviderError::provider(
            PROVIDER,
            error.message.unwrap_or_else(|| "stream error".to_string()),
        ));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.and_then(|d| d.content))
        .collect();
    if text.is_empty() {
        Ok(StreamPayload::Skip)
    } else {
        Ok(StreamPayload::Delta(text))
    }
}

/// Incremental server-sent-events decoder yielding `data:` payloads.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Frames are split on raw bytes so a multi-byte character cut across
    /// two reads is only decoded once the frame is complete.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        let mut out = Vec::new();
        while let Some(end) = find_frame_end(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(data) = frame_data(&String::from_utf8_lossy(&frame)) {
                out.push(data);
            }
        }
        out
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub(crate) fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buf);
        frame_data(&String::from_utf8_lossy(&rest)).into_iter().collect()
    }
}

fn find_frame_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn frame_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.strip_prefix(' ').unwrap_or(l))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_decoder_handles_split_frames() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"data: {\"a\"").is_empty());
        let out = dec.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn sse_decoder_keeps_multibyte_chars_split_across_reads() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"Fee: 50 \u{20ac}\"}}]}\n\n";
        let bytes = frame.as_bytes();
        // One byte into the three-byte euro sign.
        let cut = frame.find('\u{20ac}').unwrap() + 1;

        let mut dec = SseDecoder::default();
        assert!(dec.push(&bytes[..cut]).is_empty());
        let out = dec.push(&bytes[cut..]);
        assert_eq!(out.len(), 1);
        assert_eq!(
            parse_stream_payload(&out[0]).unwrap(),
            StreamPayload::Delta("Fee: 50 \u{20ac}".into())
        );
    }

    #[test]
    fn sse_decoder_ignores_comments_and_crlf() {
        let mut dec = SseDecoder::default();
        let out = dec.push(b": keep-alive\r\n\r\ndata: x\r\n\r\n");
        assert_eq!(out, vec!["x".to_string()]);
    }

    #[test]
    fn sse_decoder_flushes_unterminated_tail() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish(), vec!["tail".to_string()]);
    }

    #[test]
    fn stream_payload_extracts_delta_text() {
        let p = parse_stream_payload(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap();
        assert_eq!(p, StreamPayload::Delta("Hel".into()));
        let p = parse_stream_payload(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert_eq!(p, StreamPayload::Skip);
        assert_eq!(parse_stream_payload("[DONE]").unwrap(), StreamPayload::Done);
    }

    #[test]
    fn stream_payload_surfaces_inline_errors() {
        let err = parse_stream_payload(r#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }
}
