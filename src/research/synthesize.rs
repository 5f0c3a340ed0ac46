//! Final-answer synthesis over aggregated search outcomes.

use crate::gateway::{
    Attribution, ChatChunkStream, ChatGateway, ChatRequest, Message, ProviderError,
};
use crate::prompts::{synthesis_prompt, SynthesisInput};

use super::types::SearchOutcome;

/// How the answer is delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    /// One call, one complete answer.
    Batch,
    /// Incremental chunks forwarded as they arrive.
    Streaming,
}

pub struct Synthesizer<'a> {
    gateway: &'a dyn ChatGateway,
    model: &'a str,
}

impl<'a> Synthesizer<'a> {
    pub fn new(gateway: &'a dyn ChatGateway, model: &'a str) -> Self {
        Self { gateway, model }
    }

    fn request(
        &self,
        context: &[Message],
        question: &str,
        outcomes: &[SearchOutcome],
        attribution: Attribution,
    ) -> ChatRequest {
        let inputs: Vec<SynthesisInput<'_>> = outcomes
            .iter()
            .map(|o| SynthesisInput {
                query: &o.task.query,
                scope: o.task.kind.as_str(),
                status: o.status.as_str(),
                content: &o.content,
                citations: &o.citations,
            })
            .collect();
        let prompt = synthesis_prompt(context, question, &inputs);
        ChatRequest::new(self.model, prompt.to_messages(), attribution).temperature(0.3)
    }

    pub async fn batch(
        &self,
        context: &[Message],
        question: &str,
        outcomes: &[SearchOutcome],
        attribution: Attribution,
    ) -> Result<String, ProviderError> {
        let response = self
            .gateway
            .chat(self.request(context, question, outcomes, attribution))
            .await?;
        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::provider("synthesis", "empty answer"));
        }
        Ok(text)
    }

    pub async fn stream(
        &self,
        context: &[Message],
        question: &str,
        outcomes: &[SearchOutcome],
        attribution: Attribution,
    ) -> Result<ChatChunkStream, ProviderError> {
        self.gateway
            .chat_stream(self.request(context, question, outcomes, attribution))
            .await
    }
}
