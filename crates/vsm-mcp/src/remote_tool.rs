use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use vsm_core::{Bus, ExecutionPolicy, Message, Observable, Tool, ToolDescriptor, ToolError};

use crate::client::McpClient;
use crate::error::McpError;

/// A tool hosted by a remote server, registered under a local name.
pub struct RemoteTool {
    client: Arc<McpClient>,
    remote_name: String,
    descriptor: ToolDescriptor,
    bus: OnceLock<Bus>,
}

impl RemoteTool {
    /// `descriptor` is what the model sees; its name may carry a prefix.
    pub fn new(client: Arc<McpClient>, remote_name: impl Into<String>, descriptor: ToolDescriptor) -> Self {
        Self {
            client,
            remote_name: remote_name.into(),
            descriptor,
            bus: OnceLock::new(),
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    fn progress(&self, text: String) {
        if let Some(bus) = self.bus.get() {
            let path = vec![
                "mcp".to_string(),
                "client".to_string(),
                self.client.name().to_string(),
                self.remote_name.clone(),
            ];
            bus.emit(Message::progress(text, path));
        }
    }
}

impl Observable for RemoteTool {
    fn observe(&self, bus: &Bus) {
        if self.bus.set(bus.clone()).is_err() {
            debug!(tool = %self.descriptor.name, "already observing a bus");
        }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy::Isolated
    }

    async fn run(&self, args: Value) -> Result<Value, ToolError> {
        let target = format!("{}.{}", self.client.name(), self.remote_name);
        self.progress(format!("mcp call {target}"));
        let outcome = self.client.call_tool(&self.remote_name, args).await;
        self.progress(format!("mcp result {target}"));
        match outcome {
            Ok(text) => Ok(Value::String(text)),
            Err(McpError::ToolReported(text)) => Err(ToolError::Remote(text)),
            Err(McpError::Timeout(after)) => Err(ToolError::Timeout(after)),
            Err(e) => Err(ToolError::Remote(e.to_string())),
        }
    }

    fn as_observable(&self) -> Option<&dyn Observable> {
        Some(self)
    }
}
