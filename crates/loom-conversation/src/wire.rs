//! JSON bodies exchanged between the agent server and remote conversations.

use loom_protocol::{AgentStatus, ConversationId, Event, EventId};
use loom_security::ConfirmationPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartConversationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_policy: Option<ConfirmationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_detection: Option<bool>,
    /// Sent as the first user message; the server starts a run for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_message: Option<String>,
}

/// Server view of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: ConversationId,
    pub agent_status: AgentStatus,
    /// True while a run task holds the conversation.
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub state: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default = "default_role")]
    pub role: String,
    pub content: String,
    /// Start a run after appending the message.
    #[serde(default)]
    pub run: bool,
}

impl SendMessageRequest {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: default_role(),
            content: content.into(),
            run: false,
        }
    }
}

fn default_role() -> String {
    "user".to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationResponseRequest {
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One page of `GET /events/search`. `next_page_id` is the id of the first
/// event of the following page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub items: Vec<Event>,
    #[serde(default)]
    pub next_page_id: Option<EventId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn send_message_defaults_to_a_user_message_without_run() -> anyhow::Result<()> {
        let request: SendMessageRequest = serde_json::from_value(json!({ "content": "hi" }))?;
        assert_eq!(request, SendMessageRequest::user("hi"));
        Ok(())
    }

    #[test]
    fn event_pages_decode_events_by_shape() -> anyhow::Result<()> {
        let page: EventPage = serde_json::from_value(json!({
            "items": [{
                "id": "evt-1",
                "timestamp": "2025-01-01T00:00:00Z",
                "source": "user",
                "llm_message": { "role": "user", "content": "hello" }
            }],
            "next_page_id": null
        }))?;
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id.as_str(), "evt-1");
        assert!(page.next_page_id.is_none());
        Ok(())
    }
}
