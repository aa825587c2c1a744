//! Wire type definitions
//!
//! Types for the line-delimited tool-invocation protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved tool that returns the registered tool descriptors
pub const LIST_TOOLS: &str = "_list_tools";

/// Tool invocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back on the response
    pub id: String,

    /// Tool name
    pub tool: String,

    /// Tool parameters
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl Request {
    /// Create a request with the given id
    pub fn new(id: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            params,
        }
    }
}

/// Content item carried by a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Content {
    /// Text content
    #[serde(rename = "text")]
    Text { text: String },
}

/// Tool invocation response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Id of the request this answers
    pub id: String,

    /// Result content
    pub content: Vec<Content>,

    /// Whether the invocation resulted in an error
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Response {
    /// Create a text result
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: vec![Content::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: vec![Content::Text {
                text: format!("Error: {}", message.into()),
            }],
            is_error: true,
        }
    }

    /// Text of the first content item
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|item| match item {
            Content::Text { text } => Some(text.as_str()),
        })
    }
}

/// Tool descriptor returned by `_list_tools`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,

    /// Tool description
    pub description: String,

    /// Parameter schema (JSON Schema)
    pub parameters: Value,
}
