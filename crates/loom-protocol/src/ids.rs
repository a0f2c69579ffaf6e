//! Typed identifiers used across a conversation.
//!
//! All IDs are serde-transparent String wrappers. Fresh IDs are UUID v4, but any
//! string is accepted so records written by other producers stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for an event in a conversation log.
    EventId
);
typed_id!(
    /// Unique identifier for a conversation.
    ConversationId
);
typed_id!(
    /// Identifier the model assigns to one tool call.
    ToolCallId
);
typed_id!(
    /// Identifier of one model turn. Parallel tool calls share it, and it doubles
    /// as the `previous_response_id` continuation token.
    ResponseId
);

impl ToolCallId {
    /// Synthesized call id for actions the runtime creates on the model's behalf.
    pub fn synthesized() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_ids_are_uuids() {
        let id = EventId::new_uuid();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(id, EventId::default());
    }

    #[test]
    fn conversation_id_accepts_any_string() {
        let id = ConversationId::from_string("conv-1");
        assert_eq!(id.as_str(), "conv-1");
        assert_eq!(id.to_string(), "conv-1");
    }

    #[test]
    fn provider_ids_keep_their_exact_text_on_the_wire() {
        let response = ResponseId::from("resp_abc123");
        let call = ToolCallId::from("toolu_01A");
        let payload = serde_json::json!({ "response": response, "call": call });
        assert_eq!(
            payload,
            serde_json::json!({ "response": "resp_abc123", "call": "toolu_01A" })
        );

        let back: ToolCallId = serde_json::from_value(payload["call"].clone()).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn synthesized_tool_call_ids_are_prefixed() {
        let id = ToolCallId::synthesized();
        assert!(id.as_str().starts_with("call_"));
        assert_ne!(id, ToolCallId::synthesized());
    }
}
