use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use loom_protocol::{
    Action, ConversationId, FINISH_TOOL_NAME, Observation, SecurityRisk, THINK_OBSERVATION,
    THINK_TOOL_NAME, ToolCallRequest, ToolSpec,
};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

pub const SECURITY_RISK_FIELD: &str = "security_risk";

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub conversation_id: ConversationId,
}

/// A tool the agent can call: schema, executor and data converter.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Turn schema-valid arguments into the typed action.
    fn to_action(&self, arguments: Map<String, Value>) -> Result<Action> {
        Ok(Action::Tool { arguments })
    }

    async fn execute(&self, action: &Action, context: &ToolContext) -> Result<Observation>;

    /// Content the model sees for one of this tool's observations.
    fn observation_content(&self, observation: &Observation) -> String {
        observation.to_llm_content()
    }
}

fn string_argument(arguments: &Map<String, Value>, field: &str) -> Result<String> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("requires a string '{field}' argument"))
}

#[derive(Debug, Default)]
pub struct FinishTool;

#[async_trait]
impl Tool for FinishTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            FINISH_TOOL_NAME,
            "Signal that the task is complete, with a final message for the user.",
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Final message to the user" }
                },
                "required": ["message"]
            }),
        )
        .read_only()
    }

    fn to_action(&self, arguments: Map<String, Value>) -> Result<Action> {
        Ok(Action::finish(string_argument(&arguments, "message")?))
    }

    async fn execute(&self, action: &Action, _context: &ToolContext) -> Result<Observation> {
        match action {
            Action::Finish { message } => Ok(Observation::Finish {
                message: message.clone(),
            }),
            other => anyhow::bail!("finish cannot execute {other:?}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            THINK_TOOL_NAME,
            "Write down a thought. Does not change anything; use it to reason through a plan.",
            json!({
                "type": "object",
                "properties": {
                    "thought": { "type": "string", "description": "The thought to log" }
                },
                "required": ["thought"]
            }),
        )
        .read_only()
    }

    fn to_action(&self, arguments: Map<String, Value>) -> Result<Action> {
        Ok(Action::Think {
            thought: string_argument(&arguments, "thought")?,
        })
    }

    async fn execute(&self, action: &Action, _context: &ToolContext) -> Result<Observation> {
        match action {
            Action::Think { .. } => Ok(Observation::Think {
                content: THINK_OBSERVATION.to_owned(),
            }),
            other => anyhow::bail!("think cannot execute {other:?}"),
        }
    }
}

/// Why a raw model tool call could not become an action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolCallError {
    #[error("tool call {call_id} has type '{call_type}'; only function tool calls are supported")]
    NotFunction { call_id: String, call_type: String },
    #[error("tool call {call_id} is missing a function name")]
    MissingName { call_id: String },
    #[error("Tool '{name}' not found. Available tools: [{}]", .available.join(", "))]
    NotFound { name: String, available: Vec<String> },
    #[error("Invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },
}

impl ToolCallError {
    /// Tool name to record on the resulting error event.
    pub fn tool_name(&self) -> &str {
        match self {
            Self::NotFunction { .. } | Self::MissingName { .. } => "",
            Self::NotFound { name, .. } | Self::InvalidArguments { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub tool_name: String,
    pub action: Action,
    /// Risk the model attached to the call, when it sent one.
    pub reported_risk: Option<SecurityRisk>,
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(FinishTool));
        registry.register(Arc::new(ThinkTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        debug!(tool = %name, "tool registered");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Specs advertised to the model. With `request_risk`, every non-builtin
    /// tool additionally requires a `security_risk` argument.
    pub fn specs(&self, request_risk: bool) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| {
                let mut spec = tool.spec();
                if request_risk && !is_builtin(&spec.name) {
                    add_risk_property(&mut spec.input_schema);
                }
                spec
            })
            .collect()
    }

    /// Validate a raw call: function type, a name, a registered tool, and
    /// arguments that parse against the tool's schema.
    #[instrument(skip(self, call), fields(call_id = %call.id, tool = ?call.name))]
    pub fn validate(&self, call: &ToolCallRequest) -> Result<ValidatedCall, ToolCallError> {
        if !call.is_function() {
            return Err(ToolCallError::NotFunction {
                call_id: call.id.clone(),
                call_type: call.call_type.clone(),
            });
        }
        let name = match call.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => {
                return Err(ToolCallError::MissingName {
                    call_id: call.id.clone(),
                });
            }
        };
        let tool = self.get(&name).ok_or_else(|| ToolCallError::NotFound {
            name: name.clone(),
            available: self.names(),
        })?;

        let invalid = |reason: String| ToolCallError::InvalidArguments {
            name: name.clone(),
            reason,
        };
        let mut arguments = parse_arguments(&call.arguments).map_err(invalid)?;
        let reported_risk = match arguments.remove(SECURITY_RISK_FIELD) {
            Some(Value::String(raw)) => Some(raw.parse::<SecurityRisk>().map_err(invalid)?),
            Some(other) => {
                return Err(invalid(format!("security_risk must be a string, got {other}")));
            }
            None => None,
        };
        validate_arguments(&tool.spec().input_schema, &Value::Object(arguments.clone()))
            .map_err(invalid)?;
        let action = tool
            .to_action(arguments)
            .map_err(|error| invalid(error.to_string()))?;

        Ok(ValidatedCall {
            tool_name: name,
            action,
            reported_risk,
        })
    }
}

pub fn is_builtin(name: &str) -> bool {
    name == FINISH_TOOL_NAME || name == THINK_TOOL_NAME
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(arguments)) => Ok(arguments),
        Ok(other) => Err(format!("arguments must be a JSON object, got {other}")),
        Err(error) => Err(format!("arguments are not valid JSON: {error}")),
    }
}

/// Validate tool arguments against the tool's input schema (Draft 2020-12).
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let validator = jsonschema::draft202012::new(schema)
        .map_err(|error| format!("invalid tool schema: {error}"))?;
    let messages = validator
        .iter_errors(arguments)
        .map(|error| error.to_string())
        .collect::<Vec<_>>();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages.join("; "))
    }
}

fn add_risk_property(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };
    if let Some(Value::Object(properties)) = object.get_mut("properties") {
        properties.insert(
            SECURITY_RISK_FIELD.to_owned(),
            json!({
                "type": "string",
                "enum": ["LOW", "MEDIUM", "HIGH"],
                "description": "Your assessment of how risky this call is"
            }),
        );
    }
    match object.get_mut("required") {
        Some(Value::Array(required)) => required.push(json!(SECURITY_RISK_FIELD)),
        _ => {
            object.insert("required".to_owned(), json!([SECURITY_RISK_FIELD]));
        }
    }
}
