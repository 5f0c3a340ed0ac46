//! Intent classification: one tool-calling LLM round trip per turn.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{info, warn};

use crate::gateway::{Attribution, ChatGateway, ChatRequest, Message, ToolCall};
use crate::prompts::{router_tools, LIST_TOOL, ROUTER_SYSTEM, SEARCH_TOOL};

use super::error::ClassificationFailure;
use super::types::RouterDecision;

#[derive(Debug, Deserialize)]
struct ToolArgs {
    query: String,
}

/// Ask the router for exactly one decision over the recent conversation.
///
/// Never retries. A timeout, transport error or unusable answer comes back as
/// a [`ClassificationFailure`] so the driver can end the turn cleanly.
pub async fn classify(
    gateway: &dyn ChatGateway,
    model: &str,
    context: &[Message],
    timeout: Duration,
    attribution: Attribution,
) -> Result<RouterDecision, ClassificationFailure> {
    let mut messages = Vec::with_capacity(context.len() + 1);
    messages.push(Message::system(ROUTER_SYSTEM));
    messages.extend(context.iter().cloned());

    let request = ChatRequest::new(model, messages, attribution).tools(router_tools());

    let started = Instant::now();
    let response = match tokio::time::timeout(timeout, gateway.chat(request)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => {
            warn!(error = %err, "router call failed");
            return Err(ClassificationFailure::Transport(err));
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "router timed out");
            return Err(ClassificationFailure::Timeout(timeout));
        }
    };

    let decision = decision_from_response(&response.tool_calls, &response.content)?;
    info!(
        mode = decision.mode_label(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "router decided"
    );
    Ok(decision)
}

fn decision_from_response(
    tool_calls: &[ToolCall],
    content: &str,
) -> Result<RouterDecision, ClassificationFailure> {
    let Some(call) = tool_calls.first() else {
        let reply = content.trim();
        if reply.is_empty() {
            return Err(ClassificationFailure::Malformed(
                "neither a tool call nor a reply".into(),
            ));
        }
        return Ok(RouterDecision::Direct {
            reply: reply.to_string(),
        });
    };

    let args: ToolArgs = call
        .parse_arguments()
        .map_err(|e| ClassificationFailure::Malformed(format!("{} arguments: {e}", call.name)))?;
    let query = args.query.trim().to_string();
    if query.is_empty() {
        return Err(ClassificationFailure::Malformed(format!(
            "{} called with an empty query",
            call.name
        )));
    }

    match call.name.as_str() {
        LIST_TOOL => Ok(RouterDecision::ListSearch { query }),
        SEARCH_TOOL => Ok(RouterDecision::InternetSearch { query }),
        other => Err(ClassificationFailure::Malformed(format!(
            "unknown tool {other}"
        ))),
    }
}
