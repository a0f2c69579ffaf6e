//! Error types shared by the conversation runtime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("duplicate event id: {0}")]
    DuplicateEventId(String),
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("event index {index} out of range for log of length {len}")]
    IndexOutOfRange { index: isize, len: usize },
    #[error("malformed event record: {0}")]
    MalformedRecord(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(
        "previous_response_id is set but model '{model}' does not use the responses API; \
         refusing to continue a response chain over chat completions"
    )]
    ResponsesApiMismatch { model: String },
    #[error("max iterations reached: {0}")]
    MaxIterationsReached(u32),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("llm error: {0}")]
    Llm(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for ConversationError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for ConversationError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type ConversationResult<T> = Result<T, ConversationError>;
