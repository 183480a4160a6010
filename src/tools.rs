//! Built-in tools shipped with the binary.

use async_trait::async_trait;
use serde_json::{json, Value};
use vsm_core::{ExecutionPolicy, Tool, ToolDescriptor, ToolError};

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            "Echo the given text back",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        )
    }

    async fn run(&self, args: Value) -> Result<Value, ToolError> {
        match args.get("text").and_then(Value::as_str) {
            Some(text) => Ok(Value::String(text.to_string())),
            None => Err(ToolError::InvalidArguments("`text` must be a string".into())),
        }
    }
}

/// Reads the system clock on the worker pool.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "clock",
            "Current UTC time in RFC 3339",
            json!({"type": "object", "properties": {}}),
        )
    }

    fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Isolated
    }

    async fn run(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(Value::String(chrono::Utc::now().to_rfc3339()))
    }
}
