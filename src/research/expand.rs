//! Query expansion: restated question -> 1..=3 focused sub-queries.

use std::collections::HashSet;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::gateway::{Attribution, ChatGateway, ChatRequest};
use crate::prompts::expansion_prompt;

use super::error::ParseError;
use super::extract_json;
use super::types::SearchMode;

/// Hard ceiling on sub-queries regardless of configuration.
pub const MAX_SUB_QUERIES: usize = 3;

#[derive(Debug, Deserialize)]
struct ExpansionJson {
    #[serde(default)]
    queries: Vec<String>,
}

/// Parse `{"queries": [...]}`: trims, drops blanks and case-insensitive
/// duplicates, keeps at most `max` in model order.
pub fn parse_expansion(raw: &str, max: usize) -> Result<Vec<String>, ParseError> {
    let json = extract_json(raw).ok_or(ParseError::NoJson)?;
    let parsed: ExpansionJson =
        serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))?;

    let mut seen = HashSet::new();
    let queries: Vec<String> = parsed
        .queries
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty() && seen.insert(q.to_lowercase()))
        .take(max.clamp(1, MAX_SUB_QUERIES))
        .collect();

    if queries.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(queries)
}

async fn request_expansion(
    gateway: &dyn ChatGateway,
    model: &str,
    mode: SearchMode,
    restated: &str,
    max: usize,
    attribution: Attribution,
) -> Result<Vec<String>, ParseError> {
    let prompt = expansion_prompt(mode, restated);
    let request = ChatRequest::new(model, prompt.to_messages(), attribution)
        .temperature(0.2)
        .json();
    let response = gateway.chat(request).await?;
    parse_expansion(&response.content, max)
}

/// Always returns at least one query: on any failure the restated query is
/// used verbatim.
pub async fn expand_queries(
    gateway: &dyn ChatGateway,
    model: &str,
    mode: SearchMode,
    restated: &str,
    max: usize,
    attribution: Attribution,
) -> Vec<String> {
    match request_expansion(gateway, model, mode, restated, max, attribution).await {
        Ok(queries) => {
            debug!(mode = mode.as_str(), count = queries.len(), "expanded query");
            queries
        }
        Err(err) => {
            warn!(error = %err, "query expansion failed; using restated query");
            vec![restated.to_string()]
        }
    }
}
