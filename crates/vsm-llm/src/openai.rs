//! OpenAI-compatible chat-completions adapter.
//!
//! Streams `choices[0].delta` frames. Tool-call argument fragments arrive
//! keyed by `tool_calls[].index` and are parsed when `finish_reason`
//! arrives.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use vsm_core::{
    ConversationTurn, EventSink, InvokePolicy, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderFamily, ToolDescriptor,
};

use crate::sse::{SseFrame, StreamParser, SSE_IDLE_TIMEOUT};
use crate::tool_args::ToolCallAccumulator;
use crate::transport;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub model: String,
    pub api_key: SecretString,
    pub base_url: String,
    pub max_tokens: Option<u32>,
    pub idle_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
            max_tokens: None,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

pub struct OpenAiAdapter {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: transport::http_client(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(
        &self,
        conversation: &[ConversationTurn],
        tools: &[ToolDescriptor],
        policy: &InvokePolicy,
    ) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": to_openai_messages(conversation, policy.system_prompt.as_deref()),
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolDescriptor::to_openai_tool).collect());
            body["tool_choice"] = json!("auto");
        }
        if let Some(max) = policy.max_tokens.or(self.config.max_tokens) {
            body["max_tokens"] = json!(max);
        }
        if let Some(t) = policy.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    #[instrument(skip_all, fields(provider = "openai", model = %self.config.model))]
    async fn invoke(
        &self,
        conversation: &[ConversationTurn],
        tools: &[ToolDescriptor],
        policy: &InvokePolicy,
        sink: &mut EventSink<'_>,
    ) -> Result<(), ProviderError> {
        let body = self.build_body(conversation, tools, policy);
        debug!(turns = conversation.len(), tools = tools.len(), "sending request");
        let request = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body);

        let mut parser = OpenAiStreamParser::new();
        let outcome = async {
            let response = transport::send(request).await?;
            transport::drive_sse(response, &mut parser, sink, self.config.idle_timeout).await
        }
        .await;
        transport::conclude("openai", outcome, sink);
        Ok(())
    }
}

/// Neutral conversation → chat-completions `messages`.
pub fn to_openai_messages(conversation: &[ConversationTurn], system: Option<&str>) -> Vec<Value> {
    let mut messages = Vec::with_capacity(conversation.len() + 1);
    if let Some(system) = system.filter(|s| !s.is_empty()) {
        messages.push(json!({"role": "system", "content": system}));
    }
    for turn in conversation {
        messages.push(match turn {
            ConversationTurn::User { content } => json!({"role": "user", "content": content}),
            ConversationTurn::Assistant { content } => {
                json!({"role": "assistant", "content": content})
            }
            ConversationTurn::AssistantToolCalls {
                content,
                tool_calls,
            } => json!({
                "role": "assistant",
                "content": if content.is_empty() { Value::Null } else { json!(content) },
                "tool_calls": tool_calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments.to_string()},
                })).collect::<Vec<_>>(),
            }),
            ConversationTurn::ToolResult {
                tool_call_id,
                content,
                ..
            } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
        });
    }
    messages
}

/// Stream state for one chat-completions response.
#[derive(Debug, Default)]
pub struct OpenAiStreamParser {
    text: String,
    calls: ToolCallAccumulator,
    done: bool,
}

impl OpenAiStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn terminal(&mut self) -> ProviderEvent {
        self.done = true;
        if self.calls.is_empty() {
            ProviderEvent::AssistantFinal(std::mem::take(&mut self.text))
        } else {
            ProviderEvent::ToolCalls(self.calls.take())
        }
    }
}

impl StreamParser for OpenAiStreamParser {
    fn feed(&mut self, frame: &SseFrame) -> Vec<ProviderEvent> {
        if self.done {
            return Vec::new();
        }
        let data = frame.data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }
        let chunk: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparseable frame");
                return Vec::new();
            }
        };
        if let Some(err) = chunk.get("error") {
            self.done = true;
            let message = err["message"].as_str().unwrap_or("unknown error").to_string();
            return vec![ProviderEvent::AssistantFinal(
                ProviderError::InvalidRequest(message).diagnostic(),
            )];
        }

        let mut events = Vec::new();
        let Some(choice) = chunk["choices"].get(0) else {
            return events;
        };
        let delta = &choice["delta"];
        if let Some(content) = delta["content"].as_str().filter(|s| !s.is_empty()) {
            self.text.push_str(content);
            events.push(ProviderEvent::AssistantDelta(content.to_string()));
        }
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for (position, tc) in tool_calls.iter().enumerate() {
                let index = tc["index"]
                    .as_u64()
                    .and_then(|i| u32::try_from(i).ok())
                    .unwrap_or(position as u32);
                self.calls.begin(index, tc["id"].as_str(), tc["function"]["name"].as_str());
                if let Some(fragment) = tc["function"]["arguments"].as_str() {
                    self.calls.append(index, fragment);
                }
            }
        }
        if choice["finish_reason"].is_string() {
            events.push(self.terminal());
        }
        events
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.done || (self.text.is_empty() && self.calls.is_empty()) {
            self.done = true;
            return Vec::new();
        }
        vec![self.terminal()]
    }
}
