use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("turn did not end within {0:?}")]
    TurnTimeout(Duration),

    #[error("task failed: {0}")]
    Join(String),

    #[error("port {name} failed: {message}")]
    Port { name: String, message: String },
}

impl RuntimeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TurnTimeout(_) => "turn_timeout",
            Self::Join(_) => "join",
            Self::Port { .. } => "port",
        }
    }
}

impl From<tokio::task::JoinError> for RuntimeError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}
