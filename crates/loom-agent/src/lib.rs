//! # loom-agent — conversation state and the agent decision loop
//!
//! ## Module Overview
//!
//! - [`state`] — ConversationState: event log, status, policy, counters, persistence
//! - [`agent`] — Agent: `init_state` and the `step` state machine
//! - [`view`] — Condensation-aware view and event-to-message conversion
//! - [`condenser`] — History condensers
//! - [`stuck`] — Advisory loop detection
//! - [`scripted`] — Replay LLM for servers without a real model and for tests

pub mod agent;
pub mod condenser;
pub mod scripted;
pub mod state;
pub mod stuck;
pub mod view;

pub use agent::{Agent, AgentConfig, DEFAULT_SYSTEM_PROMPT, OnEvent};
pub use condenser::Condenser;
pub use scripted::{LlmRoute, RecordedCall, ScriptedLlm, ScriptedToolCall, ScriptedTurn};
pub use state::{
    BASE_STATE_FILE, ConversationState, DEFAULT_MAX_ITERATIONS, EVENTS_DIR,
};
pub use stuck::{StuckDetector, StuckPattern, StuckThresholds};
pub use view::{condensed_view, events_to_messages};
