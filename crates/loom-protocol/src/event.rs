//! Conversation event taxonomy.
//!
//! Records are written with a `kind` field for readability, but reading never
//! trusts it: the concrete type is recovered from which payload fields are
//! present, checked in the fixed order of [`RecordShape::ORDER`]. Older records
//! without any discriminator stay readable this way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::action::{Action, Observation};
use crate::error::{ConversationError, ConversationResult};
use crate::ids::{EventId, ResponseId, ToolCallId};
use crate::llm::{LlmMessage, MessageRole};
use crate::risk::SecurityRisk;
use crate::tool::{ToolCallRequest, ToolSpec};

pub const FULL_STATE_KEY: &str = "full_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Agent,
    User,
    #[default]
    Environment,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::User => "user",
            Self::Environment => "environment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPromptEvent {
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub llm_message: LlmMessage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activated_microagents: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_content: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    #[serde(default)]
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking_blocks: Vec<String>,
    pub action: Action,
    pub tool_name: String,
    pub tool_call_id: ToolCallId,
    pub tool_call: ToolCallRequest,
    pub llm_response_id: ResponseId,
    #[serde(default)]
    pub security_risk: SecurityRisk,
}

impl ActionEvent {
    /// An action with a synthesized tool call that replays `action`'s arguments.
    pub fn new(action: Action, tool_name: impl Into<String>, llm_response_id: ResponseId) -> Self {
        let tool_name = tool_name.into();
        let tool_call_id = ToolCallId::synthesized();
        let tool_call = ToolCallRequest::function(
            tool_call_id.as_str(),
            tool_name.as_str(),
            &action.to_arguments(),
        );
        Self {
            thought: String::new(),
            reasoning_content: None,
            thinking_blocks: Vec::new(),
            action,
            tool_name,
            tool_call_id,
            tool_call,
            llm_response_id,
            security_risk: SecurityRisk::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonExecutableActionEvent {
    #[serde(default)]
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking_blocks: Vec<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub llm_response_id: ResponseId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub observation: Observation,
    pub action_id: EventId,
    pub tool_name: String,
    pub tool_call_id: ToolCallId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorEvent {
    pub error: String,
    #[serde(default)]
    pub tool_name: String,
    pub tool_call_id: ToolCallId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRejectObservation {
    pub rejection_reason: String,
    pub action_id: EventId,
    pub tool_name: String,
    pub tool_call_id: ToolCallId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condensation {
    pub forgotten_event_ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Position in the condensed view where the summary is inserted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondensationSummaryEvent {
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PauseEvent {}

/// Full snapshot (`key == "full_state"`) or a single-field delta of the
/// conversation state, pushed to remote observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationStateUpdateEvent {
    pub key: String,
    pub value: Value,
}

impl ConversationStateUpdateEvent {
    pub fn full_state(snapshot: Value) -> Self {
        Self {
            key: FULL_STATE_KEY.to_owned(),
            value: snapshot,
        }
    }

    pub fn field(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn is_full_state(&self) -> bool {
        self.key == FULL_STATE_KEY
    }

    /// Merge this update into a cached state map. A full snapshot is
    /// dict-updated into the cache, so keys it omits survive.
    pub fn apply_to(&self, cache: &mut Map<String, Value>) {
        if self.is_full_state() {
            if let Value::Object(snapshot) = &self.value {
                for (key, value) in snapshot {
                    cache.insert(key.clone(), value.clone());
                }
            }
        } else {
            cache.insert(self.key.clone(), self.value.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum EventKind {
    #[serde(rename = "SystemPromptEvent")]
    SystemPrompt(SystemPromptEvent),
    #[serde(rename = "MessageEvent")]
    Message(MessageEvent),
    #[serde(rename = "ActionEvent")]
    Action(ActionEvent),
    #[serde(rename = "NonExecutableActionEvent")]
    NonExecutableAction(NonExecutableActionEvent),
    #[serde(rename = "ObservationEvent")]
    Observation(ObservationEvent),
    #[serde(rename = "AgentErrorEvent")]
    AgentError(AgentErrorEvent),
    #[serde(rename = "UserRejectObservation")]
    UserReject(UserRejectObservation),
    #[serde(rename = "Condensation")]
    Condensation(Condensation),
    #[serde(rename = "CondensationSummaryEvent")]
    CondensationSummary(CondensationSummaryEvent),
    #[serde(rename = "PauseEvent")]
    Pause(PauseEvent),
    #[serde(rename = "ConversationStateUpdateEvent")]
    StateUpdate(ConversationStateUpdateEvent),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        self.shape().name()
    }

    pub fn shape(&self) -> RecordShape {
        match self {
            Self::SystemPrompt(_) => RecordShape::SystemPrompt,
            Self::Message(_) => RecordShape::Message,
            Self::Action(_) => RecordShape::Action,
            Self::NonExecutableAction(_) => RecordShape::NonExecutableAction,
            Self::Observation(_) => RecordShape::Observation,
            Self::AgentError(_) => RecordShape::AgentError,
            Self::UserReject(_) => RecordShape::UserReject,
            Self::Condensation(_) => RecordShape::Condensation,
            Self::CondensationSummary(_) => RecordShape::CondensationSummary,
            Self::Pause(_) => RecordShape::Pause,
            Self::StateUpdate(_) => RecordShape::StateUpdate,
        }
    }

    /// Whether this event contributes a message to the model's view.
    pub fn is_llm_convertible(&self) -> bool {
        !matches!(
            self,
            Self::Condensation(_) | Self::Pause(_) | Self::StateUpdate(_)
        )
    }

    /// Recover the concrete kind of a payload whose envelope fields have
    /// already been removed.
    pub fn from_payload(payload: Map<String, Value>) -> ConversationResult<Self> {
        let shape = RecordShape::detect(&payload).ok_or_else(|| {
            let mut keys: Vec<&str> = payload.keys().map(String::as_str).collect();
            keys.sort_unstable();
            ConversationError::MalformedRecord(format!(
                "no event type matches fields {keys:?}"
            ))
        })?;
        let value = Value::Object(payload);
        let kind = match shape {
            RecordShape::Condensation => Self::Condensation(serde_json::from_value(value)?),
            RecordShape::StateUpdate => Self::StateUpdate(serde_json::from_value(value)?),
            RecordShape::SystemPrompt => Self::SystemPrompt(serde_json::from_value(value)?),
            RecordShape::UserReject => Self::UserReject(serde_json::from_value(value)?),
            RecordShape::Observation => Self::Observation(serde_json::from_value(value)?),
            RecordShape::Action => Self::Action(serde_json::from_value(value)?),
            RecordShape::NonExecutableAction => {
                Self::NonExecutableAction(serde_json::from_value(value)?)
            }
            RecordShape::AgentError => Self::AgentError(serde_json::from_value(value)?),
            RecordShape::Message => Self::Message(serde_json::from_value(value)?),
            RecordShape::CondensationSummary => {
                Self::CondensationSummary(serde_json::from_value(value)?)
            }
            RecordShape::Pause => Self::Pause(PauseEvent {}),
        };
        Ok(kind)
    }
}

/// Field-set signatures used to recover an event type from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    Condensation,
    StateUpdate,
    SystemPrompt,
    UserReject,
    Observation,
    Action,
    NonExecutableAction,
    AgentError,
    Message,
    CondensationSummary,
    Pause,
}

impl RecordShape {
    /// Match priority. Some field sets overlap (a rejection also carries
    /// `action_id` and `tool_call_id`), so this order must not change.
    pub const ORDER: [RecordShape; 11] = [
        Self::Condensation,
        Self::StateUpdate,
        Self::SystemPrompt,
        Self::UserReject,
        Self::Observation,
        Self::Action,
        Self::NonExecutableAction,
        Self::AgentError,
        Self::Message,
        Self::CondensationSummary,
        Self::Pause,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Condensation => "Condensation",
            Self::StateUpdate => "ConversationStateUpdateEvent",
            Self::SystemPrompt => "SystemPromptEvent",
            Self::UserReject => "UserRejectObservation",
            Self::Observation => "ObservationEvent",
            Self::Action => "ActionEvent",
            Self::NonExecutableAction => "NonExecutableActionEvent",
            Self::AgentError => "AgentErrorEvent",
            Self::Message => "MessageEvent",
            Self::CondensationSummary => "CondensationSummaryEvent",
            Self::Pause => "PauseEvent",
        }
    }

    fn matches(self, payload: &Map<String, Value>) -> bool {
        let has = |key: &str| payload.contains_key(key);
        match self {
            Self::Condensation => has("forgotten_event_ids"),
            Self::StateUpdate => has("key") && has("value"),
            Self::SystemPrompt => has("system_prompt"),
            Self::UserReject => has("rejection_reason"),
            Self::Observation => has("observation") && has("action_id"),
            Self::Action => has("action") && has("tool_call_id"),
            Self::NonExecutableAction => has("tool_calls"),
            Self::AgentError => has("error") && has("tool_call_id"),
            Self::Message => has("llm_message"),
            Self::CondensationSummary => has("summary"),
            Self::Pause => payload.is_empty(),
        }
    }

    pub fn detect(payload: &Map<String, Value>) -> Option<RecordShape> {
        Self::ORDER
            .into_iter()
            .find(|shape| shape.matches(payload))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(source: EventSource, kind: EventKind) -> Self {
        Self {
            id: EventId::new_uuid(),
            timestamp: Utc::now(),
            source,
            kind,
        }
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        Self::new(
            EventSource::User,
            EventKind::Message(MessageEvent {
                llm_message: LlmMessage::user(content),
                activated_microagents: Vec::new(),
                extended_content: Vec::new(),
            }),
        )
    }

    pub fn action(action: ActionEvent) -> Self {
        Self::new(EventSource::Agent, EventKind::Action(action))
    }

    pub fn state_update(update: ConversationStateUpdateEvent) -> Self {
        Self::new(EventSource::Environment, EventKind::StateUpdate(update))
    }

    pub fn from_record(record: Value) -> ConversationResult<Self> {
        let Value::Object(mut fields) = record else {
            return Err(ConversationError::MalformedRecord(
                "event record is not a JSON object".to_owned(),
            ));
        };

        let id = match fields.remove("id") {
            Some(Value::String(id)) => EventId::from_string(id),
            _ => {
                return Err(ConversationError::MalformedRecord(
                    "event record has no string id".to_owned(),
                ));
            }
        };
        let timestamp = match fields.remove("timestamp") {
            Some(value) => serde_json::from_value(value)?,
            None => Utc::now(),
        };
        let source = match fields.remove("source") {
            Some(value) => serde_json::from_value(value)?,
            None => EventSource::default(),
        };
        fields.remove("kind");

        Ok(Self {
            id,
            timestamp,
            source,
            kind: EventKind::from_payload(fields)?,
        })
    }

    pub fn as_action(&self) -> Option<&ActionEvent> {
        match &self.kind {
            EventKind::Action(action) => Some(action),
            _ => None,
        }
    }

    /// Tool call this event resolves, if it is an observation, error or
    /// rejection.
    pub fn resolved_tool_call(&self) -> Option<&ToolCallId> {
        match &self.kind {
            EventKind::Observation(observation) => Some(&observation.tool_call_id),
            EventKind::AgentError(error) => Some(&error.tool_call_id),
            EventKind::UserReject(rejection) => Some(&rejection.tool_call_id),
            _ => None,
        }
    }

    pub fn visualize(&self) -> String {
        let body = match &self.kind {
            EventKind::SystemPrompt(prompt) => {
                format!("system prompt with {} tools", prompt.tools.len())
            }
            EventKind::Message(message) => {
                let role = match message.llm_message.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => "tool",
                };
                format!("{role}: {}", message.llm_message.content)
            }
            EventKind::Action(action) => {
                let mut line = format!(
                    "{} [risk {}] {}",
                    action.tool_name,
                    action.security_risk,
                    action.action.visualize()
                );
                if !action.thought.is_empty() {
                    line = format!("{} | thought: {}", line, action.thought);
                }
                line
            }
            EventKind::NonExecutableAction(action) => {
                let names: Vec<&str> = action
                    .tool_calls
                    .iter()
                    .map(|call| call.name.as_deref().unwrap_or("<unnamed>"))
                    .collect();
                format!("non-executable tool calls: {}", names.join(", "))
            }
            EventKind::Observation(observation) => {
                format!(
                    "{} -> {}",
                    observation.tool_name,
                    observation.observation.visualize()
                )
            }
            EventKind::AgentError(error) => format!("error: {}", error.error),
            EventKind::UserReject(rejection) => {
                format!(
                    "{} rejected: {}",
                    rejection.tool_name, rejection.rejection_reason
                )
            }
            EventKind::Condensation(condensation) => {
                format!(
                    "condensed {} events",
                    condensation.forgotten_event_ids.len()
                )
            }
            EventKind::CondensationSummary(summary) => format!("summary: {}", summary.summary),
            EventKind::Pause(_) => "paused".to_owned(),
            EventKind::StateUpdate(update) => format!("state {} = {}", update.key, update.value),
        };
        format!("[{}] {}", self.source.as_str(), body)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Event::from_record(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(payload: Value) -> Value {
        let mut record = json!({
            "id": "evt-1",
            "timestamp": "2025-01-01T00:00:00Z",
            "source": "agent",
        });
        if let (Value::Object(record), Value::Object(payload)) = (&mut record, payload) {
            record.extend(payload);
        }
        record
    }

    #[test]
    fn written_records_carry_kind_and_read_back_identically() {
        let event = Event::user_message("say hi");
        let record = serde_json::to_value(&event).unwrap();
        assert_eq!(record["kind"], "MessageEvent");
        let back: Event = serde_json::from_value(record).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn legacy_record_without_kind_is_recovered() {
        let record = envelope(json!({
            "observation": { "kind": "ToolObservation", "content": "ok" },
            "action_id": "evt-0",
            "tool_name": "bash",
            "tool_call_id": "call-1",
        }));
        let event = Event::from_record(record).unwrap();
        assert_eq!(event.kind.name(), "ObservationEvent");
        assert_eq!(event.source, EventSource::Agent);
    }

    #[test]
    fn stale_kind_field_is_ignored() {
        let record = envelope(json!({
            "kind": "MessageEvent",
            "error": "boom",
            "tool_name": "bash",
            "tool_call_id": "call-1",
        }));
        let event = Event::from_record(record).unwrap();
        assert!(matches!(event.kind, EventKind::AgentError(_)));
    }

    #[test]
    fn rejection_wins_over_observation_like_fields() {
        let record = envelope(json!({
            "rejection_reason": "no",
            "action_id": "evt-0",
            "tool_name": "bash",
            "tool_call_id": "call-1",
        }));
        let event = Event::from_record(record).unwrap();
        assert!(matches!(event.kind, EventKind::UserReject(_)));
    }

    #[test]
    fn condensation_with_summary_is_not_a_summary_event() {
        let record = envelope(json!({
            "forgotten_event_ids": ["a", "b"],
            "summary": "earlier work",
            "summary_offset": 1,
        }));
        let event = Event::from_record(record).unwrap();
        assert!(matches!(event.kind, EventKind::Condensation(_)));
    }

    #[test]
    fn bare_envelope_is_a_pause() {
        let event = Event::from_record(envelope(json!({}))).unwrap();
        assert!(matches!(event.kind, EventKind::Pause(_)));
    }

    #[test]
    fn unrecognized_fields_are_rejected() {
        let error = Event::from_record(envelope(json!({ "mystery": 1 }))).unwrap_err();
        assert!(error.to_string().contains("mystery"));
    }

    #[test]
    fn full_state_update_merges_instead_of_replacing() {
        let mut cache = Map::new();
        cache.insert("agent_status".into(), json!("running"));
        cache.insert("max_iterations".into(), json!(50));

        ConversationStateUpdateEvent::full_state(json!({ "agent_status": "idle" }))
            .apply_to(&mut cache);
        assert_eq!(cache["agent_status"], "idle");
        assert_eq!(cache["max_iterations"], 50);

        ConversationStateUpdateEvent::field("agent_status", json!("finished")).apply_to(&mut cache);
        assert_eq!(cache["agent_status"], "finished");
    }
}
