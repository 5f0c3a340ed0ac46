//! Perplexity-compatible search adapter (`sonar` models).
//!
//! The endpoint is chat-shaped: the search prompt goes in as the system
//! message, the query as the user message. Domain scoping rides on
//! `search_domain_filter` and sources come back in a top-level `citations`
//! array.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{SearchError, SearchProvider, SearchRequest, SearchResponse};

const TEMPERATURE: f32 = 0.1;

/// Maximum allowed response body (2MB); structured list answers run long.
const MAX_RESPONSE_LEN: usize = 2 * 1_024 * 1_024;

#[derive(Debug, Clone)]
pub struct SonarAdapter {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl SonarAdapter {
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| SearchError::Config("Invalid API key format".into()))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SearchError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Structured list output
// =============================================================================

/// One certification / licence / approval row in list-mode answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificationRecord {
    pub certificate_name: String,
    pub certificate_description: String,
    pub legal_regulation: String,
    pub legal_text_excerpt: String,
    pub legal_text_meaning: String,
    pub registration_fee: String,
    pub is_required: bool,
}

#[derive(Debug, Deserialize)]
struct Certifications {
    certifications: Vec<CertificationRecord>,
}

fn certifications_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "certifications": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "certificate_name": { "type": "string" },
                        "certificate_description": { "type": "string" },
                        "legal_regulation": { "type": "string" },
                        "legal_text_excerpt": { "type": "string" },
                        "legal_text_meaning": { "type": "string" },
                        "registration_fee": { "type": "string" },
                        "is_required": { "type": "boolean" }
                    },
                    "required": [
                        "certificate_name", "certificate_description", "legal_regulation",
                        "legal_text_excerpt", "legal_text_meaning", "registration_fee",
                        "is_required"
                    ]
                }
            }
        },
        "required": ["certifications"]
    })
}

/// Re-render a structured answer as a pretty JSON array of records. Returns
/// `None` when the model ignored the schema, in which case the raw text is kept.
pub fn normalize_certifications(content: &str) -> Option<String> {
    let parsed: Certifications = serde_json::from_str(content.trim()).ok()?;
    serde_json::to_string_pretty(&parsed.certifications).ok()
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct SonarRequest<'a> {
    model: &'a str,
    messages: [WireMessage<'a>; 2],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_domain_filter: Option<&'a [String]>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct SonarResponse {
    #[serde(default)]
    choices: Vec<SonarChoice>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Deserialize)]
struct SonarChoice {
    message: SonarMessage,
}

#[derive(Deserialize)]
struct SonarMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl SearchProvider for SonarAdapter {
    async fn search(&self, req: SearchRequest) -> Result<SearchResponse, SearchError> {
        let body = SonarRequest {
            model: &self.model,
            messages: [
                WireMessage {
                    role: "system",
                    content: &req.prompt,
                },
                WireMessage {
                    role: "user",
                    content: &req.query,
                },
            ],
            temperature: TEMPERATURE,
            response_format: req.structured.then(|| {
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": { "schema": certifications_schema() }
                })
            }),
            search_domain_filter: (!req.domains.is_empty()).then_some(&req.domains[..]),
        };

        let mut response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SearchError::RateLimited);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SearchError::Status {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_LEN {
                return Err(SearchError::Malformed(format!(
                    "response larger than {MAX_RESPONSE_LEN} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        let parsed: SonarResponse = serde_json::from_slice(&bytes)
            .map_err(|e| SearchError::Malformed(format!("invalid JSON: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SearchError::Malformed("no choices in response".into()))?;

        let content = if req.structured {
            match normalize_certifications(&content) {
                Some(pretty) => pretty,
                None => {
                    tracing::warn!(
                        query = %req.query,
                        "structured search answer did not match schema; keeping raw text"
                    );
                    content
                }
            }
        } else {
            content
        };

        Ok(SearchResponse {
            content,
            citations: parsed.citations,
        })
    }
}
