use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("tool reported an error: {0}")]
    ToolReported(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
}

impl McpError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Rpc { .. } => "rpc",
            Self::Protocol(_) => "protocol",
            Self::ToolReported(_) => "tool_reported",
            Self::Timeout(_) => "timeout",
            Self::Closed => "closed",
        }
    }
}
