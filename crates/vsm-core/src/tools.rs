use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::ProviderFamily;
use crate::roles::{Governable, Observable};

/// Where a tool runs relative to the dispatch loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Spawned as a task on the shared scheduler. For fast, yield-friendly tools.
    #[default]
    Inline,
    /// Run on the worker pool so blocking work cannot stall the dispatch loop.
    Isolated,
}

/// Vendor-neutral tool declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }

    pub fn to_openai_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.schema,
            }
        })
    }

    pub fn to_anthropic_tool(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.schema,
        })
    }

    pub fn to_gemini_tool(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.schema,
        })
    }

    pub fn to_mcp_tool(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.schema,
            "inputSchema": self.schema,
        })
    }

    pub fn for_family(&self, family: ProviderFamily) -> Value {
        match family {
            ProviderFamily::OpenAi => self.to_openai_tool(),
            ProviderFamily::Anthropic => self.to_anthropic_tool(),
            ProviderFamily::Gemini => self.to_gemini_tool(),
        }
    }
}

/// A tool capsule: anything the dispatcher can run by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Inline
    }

    async fn run(&self, args: Value) -> Result<Value, ToolError>;

    fn as_observable(&self) -> Option<&dyn Observable> {
        None
    }

    fn as_governable(&self) -> Option<&dyn Governable> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArguments(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("unknown tool capsule: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Remote(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Panicked(String),
}

impl ToolError {
    /// Short classification used in error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::ExecutionFailed(_) => "ExecutionFailed",
            Self::UnknownTool(_) => "UnknownTool",
            Self::Remote(_) => "Remote",
            Self::Timeout(_) => "Timeout",
            Self::Panicked(_) => "Panicked",
        }
    }

    /// `ERROR: <kind>: <message>`
    pub fn to_payload(&self) -> String {
        format!("ERROR: {}: {}", self.kind(), self)
    }
}
