//! Typed input parameters declared by a workflow.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Boolean,
}

impl InputType {
    /// Returns true when `value` has this primitive type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

/// One declared workflow input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: InputType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl InputParameter {
    pub fn new(name: impl Into<String>, r#type: InputType, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            r#type,
            label: label.into(),
            description: None,
            required: false,
            default: None,
        }
    }

    pub fn string(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, InputType::String, label)
    }

    pub fn number(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, InputType::Number, label)
    }

    pub fn boolean(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(name, InputType::Boolean, label)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}
