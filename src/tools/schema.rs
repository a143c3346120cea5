//! Tool declarations and call/result payloads

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
}

/// Object schema of a tool's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub properties: BTreeMap<String, ParameterSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            kind: ParamType::Object,
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// A function the remote model may call, announced at session setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: ParameterSchema::default(),
        }
    }

    pub fn required(self, name: &str, kind: ParamType, description: &str) -> Self {
        self.param(name, kind, description, &[], true)
    }

    pub fn optional(self, name: &str, kind: ParamType, description: &str) -> Self {
        self.param(name, kind, description, &[], false)
    }

    pub fn param(
        mut self,
        name: &str,
        kind: ParamType,
        description: &str,
        allowed: &[&str],
        required: bool,
    ) -> Self {
        self.parameters.properties.insert(
            name.to_string(),
            ParameterSpec {
                kind,
                description: description.to_string(),
                allowed: allowed.iter().map(|s| s.to_string()).collect(),
            },
        );
        if required {
            self.parameters.required.push(name.to_string());
        }
        self
    }
}

/// A call requested by the model. Arguments are primitive JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// The single answer to a [`ToolCall`], keyed by the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result: String,
}
