//! # loom-protocol — conversation contract types
//!
//! Shared types every loom crate depends on: the event taxonomy persisted in
//! a conversation log, the action/observation unions tools exchange, risk and
//! status enums, and the port the language model is consumed through.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (EventId, ConversationId, ToolCallId, ResponseId)
//! - [`event`] — Event envelope + EventKind, heuristic record recovery
//! - [`action`] — Action / Observation unions and built-in tool names
//! - [`llm`] — Normalized LLM messages and responses
//! - [`tool`] — Raw tool calls and tool specifications
//! - [`risk`] — SecurityRisk
//! - [`status`] — AgentStatus
//! - [`ports`] — The `Llm` collaborator trait
//! - [`error`] — ConversationError, ConversationResult

pub mod action;
pub mod error;
pub mod event;
pub mod ids;
pub mod llm;
pub mod ports;
pub mod risk;
pub mod status;
pub mod tool;

pub use action::{
    Action, DEFAULT_FINISH_MESSAGE, FINISH_TOOL_NAME, Observation, THINK_OBSERVATION,
    THINK_TOOL_NAME,
};
pub use error::{ConversationError, ConversationResult};
pub use event::{
    ActionEvent, AgentErrorEvent, Condensation, CondensationSummaryEvent,
    ConversationStateUpdateEvent, Event, EventKind, EventSource, FULL_STATE_KEY, MessageEvent,
    NonExecutableActionEvent, ObservationEvent, PauseEvent, RecordShape, SystemPromptEvent,
    UserRejectObservation,
};
pub use ids::{ConversationId, EventId, ResponseId, ToolCallId};
pub use llm::{LlmMessage, LlmResponse, MessageRole};
pub use ports::Llm;
pub use risk::SecurityRisk;
pub use status::AgentStatus;
pub use tool::{ToolAnnotations, ToolCallRequest, ToolSpec};
