use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::ProviderError;
use crate::tools::ToolDescriptor;

/// Vendor wire-format family of an adapter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
}

impl ProviderFamily {
    /// Unknown names fall back to the OpenAI-compatible family.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Self::Anthropic,
            "gemini" | "google" => Self::Gemini,
            _ => Self::OpenAi,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Neutral conversation entry exchanged with adapters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ConversationTurn {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    AssistantToolCalls {
        /// Text the model streamed before asking for the calls.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        content: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        content: String,
    },
}

/// Per-invocation knobs handed to an adapter.
#[derive(Clone, Debug, Default)]
pub struct InvokePolicy {
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Normalized adapter output. Exactly one terminal event per invocation.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderEvent {
    AssistantDelta(String),
    AssistantFinal(String),
    ToolCalls(Vec<ToolCallRequest>),
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AssistantFinal(_) | Self::ToolCalls(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AssistantDelta(_) => "assistant_delta",
            Self::AssistantFinal(_) => "assistant_final",
            Self::ToolCalls(_) => "tool_calls",
        }
    }
}

/// Push-style receiver for adapter events. Swallows anything after the
/// first terminal event.
pub struct EventSink<'a> {
    emit: Box<dyn FnMut(ProviderEvent) + Send + 'a>,
    terminated: bool,
}

impl<'a> EventSink<'a> {
    pub fn new(emit: impl FnMut(ProviderEvent) + Send + 'a) -> Self {
        Self {
            emit: Box::new(emit),
            terminated: false,
        }
    }

    pub fn emit(&mut self, event: ProviderEvent) {
        if self.terminated {
            debug!(event = event.name(), "event after terminal ignored");
            return;
        }
        let terminal = event.is_terminal();
        (self.emit)(event);
        if terminal {
            self.terminated = true;
        }
    }

    pub fn delta(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.emit(ProviderEvent::AssistantDelta(text));
        }
    }

    pub fn final_text(&mut self, text: impl Into<String>) {
        self.emit(ProviderEvent::AssistantFinal(text.into()));
    }

    /// An empty call list terminates with an empty final instead.
    pub fn tool_calls(&mut self, calls: Vec<ToolCallRequest>) {
        if calls.is_empty() {
            self.final_text(String::new());
        } else {
            self.emit(ProviderEvent::ToolCalls(calls));
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Terminate with an empty final unless a terminal event already went out.
    pub fn finish(&mut self) {
        if !self.terminated {
            self.final_text(String::new());
        }
    }
}

/// Implemented by each LLM vendor adapter.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn family(&self) -> ProviderFamily;

    /// Stream one model response into `sink`, in real time.
    async fn invoke(
        &self,
        conversation: &[ConversationTurn],
        tools: &[ToolDescriptor],
        policy: &InvokePolicy,
        sink: &mut EventSink<'_>,
    ) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect() -> (std::sync::Arc<parking_lot::Mutex<Vec<ProviderEvent>>>, EventSink<'static>) {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let out = std::sync::Arc::clone(&seen);
        (seen, EventSink::new(move |e| out.lock().push(e)))
    }

    // ── sink ──

    #[test]
    fn only_first_terminal_passes() {
        let (seen, mut sink) = collect();
        sink.delta("he");
        sink.final_text("hello");
        sink.final_text("again");
        sink.delta("late");
        assert_eq!(
            *seen.lock(),
            vec![
                ProviderEvent::AssistantDelta("he".into()),
                ProviderEvent::AssistantFinal("hello".into()),
            ]
        );
    }

    #[test]
    fn finish_emits_empty_final_when_silent() {
        let (seen, mut sink) = collect();
        sink.finish();
        sink.finish();
        assert_eq!(*seen.lock(), vec![ProviderEvent::AssistantFinal(String::new())]);
        assert!(sink.is_terminated());
    }

    #[test]
    fn empty_tool_call_list_becomes_final() {
        let (seen, mut sink) = collect();
        sink.tool_calls(Vec::new());
        assert_eq!(*seen.lock(), vec![ProviderEvent::AssistantFinal(String::new())]);
    }

    #[test]
    fn empty_delta_is_skipped() {
        let (seen, mut sink) = collect();
        sink.delta("");
        assert!(seen.lock().is_empty());
        assert!(!sink.is_terminated());
    }

    // ── family ──

    #[test]
    fn family_from_name() {
        assert_eq!(ProviderFamily::from_name("Anthropic"), ProviderFamily::Anthropic);
        assert_eq!(ProviderFamily::from_name("google"), ProviderFamily::Gemini);
        assert_eq!(ProviderFamily::from_name("groq"), ProviderFamily::OpenAi);
        assert_eq!(
            serde_json::to_string(&ProviderFamily::OpenAi).unwrap(),
            r#""openai""#
        );
    }

    // ── conversation ──

    #[test]
    fn conversation_turn_is_role_tagged() {
        let turn = ConversationTurn::ToolResult {
            tool_call_id: "c1".into(),
            name: Some("echo".into()),
            content: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&turn).unwrap(),
            json!({"role": "tool_result", "tool_call_id": "c1", "name": "echo", "content": "hi"})
        );
    }
}
