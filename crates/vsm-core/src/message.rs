use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::SessionId;

/// Severity value that routes a message straight to the identity alert path.
pub const ALGEDONIC: &str = "algedonic";

/// Kind of a bus message. The set is open: anything the core does not
/// recognise is carried as `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    User,
    AssistantDelta,
    Assistant,
    ToolCall,
    ToolResult,
    Progress,
    Audit,
    Plan,
    Policy,
    ConfirmRequest,
    ConfirmResponse,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::User => "user",
            Self::AssistantDelta => "assistant_delta",
            Self::Assistant => "assistant",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Progress => "progress",
            Self::Audit => "audit",
            Self::Plan => "plan",
            Self::Policy => "policy",
            Self::ConfirmRequest => "confirm_request",
            Self::ConfirmResponse => "confirm_response",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "user" => Self::User,
            "assistant_delta" => Self::AssistantDelta,
            "assistant" => Self::Assistant,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "progress" => Self::Progress,
            "audit" => Self::Audit,
            "plan" => Self::Plan,
            "policy" => Self::Policy,
            "confirm_request" => Self::ConfirmRequest,
            "confirm_response" => Self::ConfirmResponse,
            _ => Self::Other(s),
        }
    }
}

impl From<MessageKind> for String {
    fn from(k: MessageKind) -> Self {
        k.as_str().to_string()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable annotations carried alongside a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn with_turn(mut self, turn_id: u64) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    pub fn with_severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.turn_id.is_none()
            && self.severity.is_none()
            && self.extra.is_empty()
    }
}

/// The envelope every collaborator exchanges over the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<String>,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Value>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            path: Vec::new(),
            corr_id: None,
            meta: Meta::default(),
        }
    }

    pub fn user(session_id: SessionId, text: impl Into<String>) -> Self {
        Self::new(MessageKind::User, Value::String(text.into())).with_meta(Meta::for_session(session_id))
    }

    pub fn tool_call(
        tool: impl Into<String>,
        args: Value,
        corr_id: impl Into<String>,
        meta: Meta,
    ) -> Self {
        let payload = ToolCallPayload {
            tool: tool.into(),
            args,
        };
        Self::new(MessageKind::ToolCall, payload.into_value())
            .with_corr_id(corr_id)
            .with_meta(meta)
    }

    pub fn tool_result(payload: Value, corr_id: Option<String>, meta: Meta) -> Self {
        Self {
            kind: MessageKind::ToolResult,
            payload,
            path: Vec::new(),
            corr_id,
            meta,
        }
    }

    pub fn progress(text: impl Into<String>, path: Vec<String>) -> Self {
        Self::new(MessageKind::Progress, Value::String(text.into())).with_path(path)
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_corr_id(mut self, corr_id: impl Into<String>) -> Self {
        self.corr_id = Some(corr_id.into());
        self
    }

    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.meta.session_id.as_ref()
    }

    /// Payload rendered as text: strings as-is, everything else as JSON.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Payload shape of a `tool_call` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCallPayload {
    pub fn from_message(message: &Message) -> Option<Self> {
        serde_json::from_value(message.payload.clone()).ok()
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({ "tool": self.tool, "args": self.args })
    }
}
