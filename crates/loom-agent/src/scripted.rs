use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use loom_protocol::{
    ConversationError, ConversationResult, Llm, LlmMessage, LlmResponse, ToolCallId,
    ToolCallRequest, ToolSpec,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRoute {
    Completion,
    Responses,
}

/// What the model was asked on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub route: LlmRoute,
    pub previous_response_id: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub tool_names: Vec<String>,
}

/// One scripted model turn as written in a replay file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ScriptedToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedToolCall {
    pub name: String,
    /// An object, or a raw string sent verbatim (possibly malformed).
    #[serde(default)]
    pub arguments: Value,
}

impl From<ScriptedTurn> for LlmResponse {
    fn from(turn: ScriptedTurn) -> Self {
        let calls = turn
            .tool_calls
            .into_iter()
            .map(|call| {
                let id = ToolCallId::synthesized();
                match call.arguments {
                    Value::String(raw) => ToolCallRequest {
                        id: id.to_string(),
                        call_type: "function".to_owned(),
                        name: Some(call.name),
                        arguments: raw,
                    },
                    Value::Null => ToolCallRequest::function(
                        id.as_str(),
                        call.name,
                        &Value::Object(Default::default()),
                    ),
                    other => ToolCallRequest::function(id.as_str(), call.name, &other),
                }
            })
            .collect();
        let mut response = LlmResponse::tool_calls(turn.content, calls);
        response.message.reasoning_content = turn.reasoning_content;
        response
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScriptFile {
    Turns(Vec<ScriptedTurn>),
    Full {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        responses_api: bool,
        turns: Vec<ScriptedTurn>,
    },
}

/// Replays a fixed queue of responses and records every call made to it.
#[derive(Debug)]
pub struct ScriptedLlm {
    model: String,
    responses_api: bool,
    script: Mutex<VecDeque<LlmResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            model: "scripted".to_owned(),
            responses_api: false,
            script: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn from_turns(turns: Vec<ScriptedTurn>) -> Self {
        Self::new(turns.into_iter().map(LlmResponse::from).collect())
    }

    /// Load a replay file: either a JSON array of turns or an object with
    /// `model`, `responses_api` and `turns`.
    pub fn from_json_file(path: &Path) -> ConversationResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ConversationError::Io(format!("failed reading {}: {error}", path.display()))
        })?;
        let llm = match serde_json::from_str::<ScriptFile>(&raw)? {
            ScriptFile::Turns(turns) => Self::from_turns(turns),
            ScriptFile::Full {
                model,
                responses_api,
                turns,
            } => {
                let llm = Self::from_turns(turns).with_responses_api(responses_api);
                match model {
                    Some(model) => llm.with_model(model),
                    None => llm,
                }
            }
        };
        debug!(path = %path.display(), turns = llm.remaining(), "llm script loaded");
        Ok(llm)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_responses_api(mut self, enabled: bool) -> Self {
        self.responses_api = enabled;
        self
    }

    pub fn push(&self, response: LlmResponse) {
        self.script.lock().push_back(response);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    fn next(
        &self,
        route: LlmRoute,
        messages: &[LlmMessage],
        tools: &[ToolSpec],
        previous_response_id: Option<&str>,
    ) -> ConversationResult<LlmResponse> {
        self.calls.lock().push(RecordedCall {
            route,
            previous_response_id: previous_response_id.map(str::to_owned),
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|tool| tool.name.clone()).collect(),
        });
        self.script
            .lock()
            .pop_front()
            .ok_or_else(|| ConversationError::Llm("llm script exhausted".to_owned()))
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    fn model(&self) -> &str {
        &self.model
    }

    fn uses_responses_api(&self) -> bool {
        self.responses_api
    }

    async fn completion(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolSpec],
    ) -> ConversationResult<LlmResponse> {
        self.next(LlmRoute::Completion, messages, tools, None)
    }

    async fn responses(
        &self,
        messages: &[LlmMessage],
        tools: &[ToolSpec],
        previous_response_id: Option<&str>,
    ) -> ConversationResult<LlmResponse> {
        self.next(LlmRoute::Responses, messages, tools, previous_response_id)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use loom_protocol::{ConversationError, Llm, LlmResponse};

    use super::{LlmRoute, ScriptedLlm};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn replays_in_order_then_reports_exhaustion() -> Result<()> {
        let llm = ScriptedLlm::new(vec![LlmResponse::text("one"), LlmResponse::text("two")]);
        assert_eq!(llm.completion(&[], &[]).await?.message.content, "one");
        assert_eq!(llm.completion(&[], &[]).await?.message.content, "two");
        assert!(matches!(
            llm.completion(&[], &[]).await,
            Err(ConversationError::Llm(_))
        ));
        assert_eq!(llm.calls().len(), 3);
        assert!(llm.calls().iter().all(|call| call.route == LlmRoute::Completion));
        Ok(())
    }

    #[tokio::test]
    async fn loads_turns_from_a_replay_file() -> Result<()> {
        let root = unique_test_root("loom-scripted");
        std::fs::create_dir_all(&root)?;
        let path = root.join("script.json");
        std::fs::write(
            &path,
            r#"{
                "model": "replay-1",
                "responses_api": true,
                "turns": [
                    { "tool_calls": [{ "name": "think", "arguments": { "thought": "hm" } }] },
                    { "tool_calls": [{ "name": "think", "arguments": "{not json" }] },
                    { "content": "done" }
                ]
            }"#,
        )?;

        let llm = ScriptedLlm::from_json_file(&path)?;
        assert_eq!(llm.model(), "replay-1");
        assert!(llm.uses_responses_api());
        assert_eq!(llm.remaining(), 3);

        let first = llm.responses(&[], &[], None).await?;
        assert_eq!(first.message.tool_calls[0].name.as_deref(), Some("think"));
        assert_eq!(first.message.tool_calls[0].arguments, r#"{"thought":"hm"}"#);
        let second = llm.responses(&[], &[], Some(first.id.as_str())).await?;
        assert_eq!(second.message.tool_calls[0].arguments, "{not json");
        assert_eq!(
            llm.calls()[1].previous_response_id.as_deref(),
            Some(first.id.as_str())
        );

        let _ = std::fs::remove_dir_all(&root);
        Ok(())
    }
}
