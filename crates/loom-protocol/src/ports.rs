use async_trait::async_trait;

use crate::error::{ConversationError, ConversationResult};
use crate::llm::{LlmMessage, LlmResponse};
use crate::tool::ToolSpec;

/// The language-model collaborator.
///
/// Implementations own transport, retries and usage accounting. An error that
/// escapes either call is treated as fatal for the current step.
#[async_trait]
pub trait Llm: Send + Sync {
    fn model(&self) -> &str;

    fn uses_responses_api(&self) -> bool {
        false
    }

    async fn completion(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolSpec],
    ) -> ConversationResult<LlmResponse>;

    async fn responses(
        &self,
        _messages: &[LlmMessage],
        _tools: &[ToolSpec],
        _previous_response_id: Option<&str>,
    ) -> ConversationResult<LlmResponse> {
        Err(ConversationError::Llm(format!(
            "model '{}' does not implement the responses API",
            self.model()
        )))
    }
}
