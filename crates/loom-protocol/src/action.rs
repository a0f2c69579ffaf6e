//! Actions the agent proposes and the observations they produce.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const FINISH_TOOL_NAME: &str = "finish";
pub const THINK_TOOL_NAME: &str = "think";
pub const DEFAULT_FINISH_MESSAGE: &str = "Task completed";
pub const THINK_OBSERVATION: &str = "Your thought has been logged.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Action {
    #[serde(rename = "FinishAction")]
    Finish { message: String },
    #[serde(rename = "ThinkAction")]
    Think { thought: String },
    /// Any registered tool other than the built-ins; `arguments` already
    /// validated against the tool's schema.
    #[serde(rename = "ToolAction")]
    Tool { arguments: Map<String, Value> },
}

impl Action {
    pub fn finish(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.trim().is_empty() {
            Self::Finish {
                message: DEFAULT_FINISH_MESSAGE.to_owned(),
            }
        } else {
            Self::Finish { message }
        }
    }

    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }

    /// Arguments as the model would have sent them, for replaying the call.
    pub fn to_arguments(&self) -> Value {
        match self {
            Self::Finish { message } => json!({ "message": message }),
            Self::Think { thought } => json!({ "thought": thought }),
            Self::Tool { arguments } => Value::Object(arguments.clone()),
        }
    }

    pub fn visualize(&self) -> String {
        match self {
            Self::Finish { message } => format!("finish: {message}"),
            Self::Think { thought } => format!("think: {thought}"),
            Self::Tool { arguments } => Value::Object(arguments.clone()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Observation {
    #[serde(rename = "FinishObservation")]
    Finish { message: String },
    #[serde(rename = "ThinkObservation")]
    Think { content: String },
    #[serde(rename = "ToolObservation")]
    Tool {
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Observation {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Tool {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Tool {
            content: content.into(),
            is_error: true,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Tool { is_error: true, .. })
    }

    pub fn to_llm_content(&self) -> String {
        match self {
            Self::Finish { message } => message.clone(),
            Self::Think { content } => content.clone(),
            Self::Tool { content, is_error } => {
                if *is_error {
                    format!("[error] {content}")
                } else {
                    content.clone()
                }
            }
        }
    }

    pub fn visualize(&self) -> String {
        match self {
            Self::Finish { message } => format!("finished: {message}"),
            Self::Think { content } => content.clone(),
            Self::Tool { content, is_error } => {
                if *is_error {
                    format!("error: {content}")
                } else {
                    content.clone()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_finish_uses_default_message() {
        assert_eq!(
            Action::finish("  "),
            Action::Finish {
                message: DEFAULT_FINISH_MESSAGE.to_owned()
            }
        );
        assert_eq!(
            Action::finish("done").to_arguments(),
            json!({ "message": "done" })
        );
    }

    #[test]
    fn action_kind_tag_is_written() {
        let value = serde_json::to_value(Action::Think {
            thought: "hmm".into(),
        })
        .unwrap();
        assert_eq!(value["kind"], "ThinkAction");
    }

    #[test]
    fn error_observation_is_marked_for_the_model() {
        let observation = Observation::error("exit 1");
        assert!(observation.is_error());
        assert_eq!(observation.to_llm_content(), "[error] exit 1");
    }
}
