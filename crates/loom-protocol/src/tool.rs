//! Tool types: raw model tool calls and tool specifications.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool call exactly as the model produced it, before any validation.
///
/// `arguments` stays the raw JSON text so a call whose arguments do not parse
/// can still be replayed to the model verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

fn default_call_type() -> String {
    "function".to_owned()
}

impl ToolCallRequest {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self {
            id: id.into(),
            call_type: default_call_type(),
            name: Some(name.into()),
            arguments: arguments.to_string(),
        }
    }

    pub fn is_function(&self) -> bool {
        self.call_type == "function"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub destructive: bool,
}

/// Schema advertised to the model for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub annotations: ToolAnnotations,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            annotations: ToolAnnotations::default(),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.annotations.read_only = true;
        self
    }

    /// Chat-completions style `{"type": "function", "function": {..}}` payload.
    pub fn to_function_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_request_defaults_to_function_type() {
        let call: ToolCallRequest =
            serde_json::from_value(json!({"id": "c1", "name": "think", "arguments": "{}"})).unwrap();
        assert!(call.is_function());
        assert_eq!(call.name.as_deref(), Some("think"));
    }

    #[test]
    fn function_json_nests_schema_as_parameters() {
        let spec = ToolSpec::new("think", "log a thought", json!({"type": "object"}));
        let payload = spec.to_function_json();
        assert_eq!(payload["function"]["name"], "think");
        assert_eq!(payload["function"]["parameters"]["type"], "object");
    }
}
