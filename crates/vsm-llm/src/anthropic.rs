//! Anthropic Messages API adapter.
//!
//! Content blocks are tracked by index. `tool_use` blocks collect
//! `input_json_delta` fragments and are parsed on their `content_block_stop`.
//! All tool calls of a response go out together at `message_stop`.

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

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub model: String,
    pub api_key: SecretString,
    pub base_url: String,
    pub max_tokens: Option<u32>,
    pub idle_timeout: Duration,
}

impl AnthropicConfig {
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

pub struct AnthropicAdapter {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            config,
            client: transport::http_client(),
        }
    }

    fn build_body(
        &self,
        conversation: &[ConversationTurn],
        tools: &[ToolDescriptor],
        policy: &InvokePolicy,
    ) -> Value {
        let max_tokens = policy
            .max_tokens
            .or(self.config.max_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let mut body = json!({
            "model": self.config.model,
            "max_tokens": max_tokens,
            "messages": to_anthropic_messages(conversation),
            "stream": true,
        });
        if let Some(system) = policy.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] =
                Value::Array(tools.iter().map(ToolDescriptor::to_anthropic_tool).collect());
        }
        if let Some(t) = policy.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    #[instrument(skip_all, fields(provider = "anthropic", model = %self.config.model))]
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
            .post(format!("{}/messages", self.config.base_url.trim_end_matches('/')))
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);

        let mut parser = AnthropicStreamParser::new();
        let outcome = async {
            let response = transport::send(request).await?;
            transport::drive_sse(response, &mut parser, sink, self.config.idle_timeout).await
        }
        .await;
        transport::conclude("anthropic", outcome, sink);
        Ok(())
    }
}

/// Neutral conversation → Messages API `messages`. Consecutive tool
/// results fold into one user message of `tool_result` blocks.
pub fn to_anthropic_messages(conversation: &[ConversationTurn]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(conversation.len());
    let mut pending_results: Vec<Value> = Vec::new();

    let flush = |messages: &mut Vec<Value>, results: &mut Vec<Value>| {
        if !results.is_empty() {
            messages.push(json!({"role": "user", "content": std::mem::take(results)}));
        }
    };

    for turn in conversation {
        match turn {
            ConversationTurn::ToolResult {
                tool_call_id,
                content,
                ..
            } => pending_results.push(json!({
                "type": "tool_result",
                "tool_use_id": tool_call_id,
                "content": content,
            })),
            ConversationTurn::User { content } => {
                flush(&mut messages, &mut pending_results);
                messages.push(json!({"role": "user", "content": content}));
            }
            ConversationTurn::Assistant { content } => {
                flush(&mut messages, &mut pending_results);
                messages.push(json!({"role": "assistant", "content": content}));
            }
            ConversationTurn::AssistantToolCalls {
                content,
                tool_calls,
            } => {
                flush(&mut messages, &mut pending_results);
                let text = (!content.is_empty()).then(|| json!({"type": "text", "text": content}));
                let blocks: Vec<Value> = text
                    .into_iter()
                    .chain(tool_calls.iter().map(
                        |c| json!({"type": "tool_use", "id": c.id, "name": c.name, "input": c.arguments}),
                    ))
                    .collect();
                messages.push(json!({"role": "assistant", "content": blocks}));
            }
        }
    }
    flush(&mut messages, &mut pending_results);
    messages
}

/// Stream state for one Messages API response.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    text: String,
    calls: ToolCallAccumulator,
    done: bool,
}

impl AnthropicStreamParser {
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

fn block_index(data: &Value) -> u32 {
    data["index"]
        .as_u64()
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0)
}

impl StreamParser for AnthropicStreamParser {
    fn feed(&mut self, frame: &SseFrame) -> Vec<ProviderEvent> {
        if self.done {
            return Vec::new();
        }
        let data: Value = match serde_json::from_str(&frame.data) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping unparseable frame");
                return Vec::new();
            }
        };
        let kind = frame
            .event
            .as_deref()
            .or_else(|| data["type"].as_str())
            .unwrap_or_default();

        match kind {
            "content_block_start" => {
                let block = &data["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        self.calls.begin(
                            block_index(&data),
                            block["id"].as_str(),
                            block["name"].as_str(),
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|s| !s.is_empty()) {
                            self.text.push_str(text);
                            return vec![ProviderEvent::AssistantDelta(text.to_string())];
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str().filter(|s| !s.is_empty()) {
                            self.text.push_str(text);
                            return vec![ProviderEvent::AssistantDelta(text.to_string())];
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(fragment) = delta["partial_json"].as_str() {
                            self.calls.append(block_index(&data), fragment);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let _ = self.calls.close(block_index(&data));
            }
            "message_stop" => return vec![self.terminal()],
            "error" => {
                self.done = true;
                let err = &data["error"];
                let message = err["message"].as_str().unwrap_or("unknown error");
                let error = match err["type"].as_str() {
                    Some("overloaded_error") => ProviderError::Overloaded,
                    Some("rate_limit_error") => ProviderError::RateLimited,
                    _ => ProviderError::StreamInterrupted(message.to_string()),
                };
                return vec![ProviderEvent::AssistantFinal(error.diagnostic())];
            }
            _ => {}
        }
        Vec::new()
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.done || (self.text.is_empty() && self.calls.is_empty()) {
            self.done = true;
            return Vec::new();
        }
        vec![self.terminal()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vsm_core::ToolCallRequest;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ev(event: &str, data: Value) -> SseFrame {
        SseFrame {
            event: Some(event.into()),
            data: data.to_string(),
        }
    }

    fn feed_all(p: &mut AnthropicStreamParser, frames: &[SseFrame]) -> Vec<ProviderEvent> {
        frames.iter().flat_map(|f| p.feed(f)).collect()
    }

    // ── parser ──

    #[test]
    fn text_stream() {
        let mut p = AnthropicStreamParser::new();
        let events = feed_all(
            &mut p,
            &[
                ev("message_start", json!({"type": "message_start"})),
                ev("content_block_start", json!({"index": 0, "content_block": {"type": "text", "text": ""}})),
                ev("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": "Hi"}})),
                ev("ping", json!({"type": "ping"})),
                ev("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": " there"}})),
                ev("content_block_stop", json!({"index": 0})),
                ev("message_stop", json!({"type": "message_stop"})),
            ],
        );
        assert_eq!(
            events,
            vec![
                ProviderEvent::AssistantDelta("Hi".into()),
                ProviderEvent::AssistantDelta(" there".into()),
                ProviderEvent::AssistantFinal("Hi there".into()),
            ]
        );
    }

    #[test]
    fn fragmented_tool_input_parses_on_block_stop() {
        let mut p = AnthropicStreamParser::new();
        let events = feed_all(
            &mut p,
            &[
                ev("content_block_start", json!({"index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {}}})),
                ev("content_block_delta", json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"a\":1"}})),
                ev("content_block_delta", json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": ",\"b\":2}"}})),
                ev("content_block_stop", json!({"index": 1})),
                ev("message_delta", json!({"delta": {"stop_reason": "tool_use"}})),
                ev("message_stop", json!({})),
            ],
        );
        assert_eq!(
            events,
            vec![ProviderEvent::ToolCalls(vec![ToolCallRequest {
                id: "toolu_1".into(),
                name: "search".into(),
                arguments: json!({"a": 1, "b": 2}),
            }])]
        );
    }

    #[test]
    fn text_before_tool_use_streams_then_calls_win() {
        let mut p = AnthropicStreamParser::new();
        let events = feed_all(
            &mut p,
            &[
                ev("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": "Let me check."}})),
                ev("content_block_start", json!({"index": 1, "content_block": {"type": "tool_use", "id": "t", "name": "clock"}})),
                ev("content_block_stop", json!({"index": 1})),
                ev("message_stop", json!({})),
            ],
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ProviderEvent::ToolCalls(c) if c[0].arguments == json!({})));
    }

    #[test]
    fn stream_error_event_is_diagnostic() {
        let mut p = AnthropicStreamParser::new();
        let events = p.feed(&ev(
            "error",
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ));
        assert!(matches!(&events[0], ProviderEvent::AssistantFinal(t) if t.contains("overloaded")));
        assert!(p.feed(&ev("message_stop", json!({}))).is_empty());
    }

    #[test]
    fn event_type_falls_back_to_data_field() {
        let mut p = AnthropicStreamParser::new();
        let events = p.feed(&SseFrame {
            event: None,
            data: json!({"type": "message_stop"}).to_string(),
        });
        assert_eq!(events, vec![ProviderEvent::AssistantFinal(String::new())]);
    }

    // ── request shape ──

    #[test]
    fn consecutive_tool_results_merge() {
        let convo = vec![
            ConversationTurn::User { content: "q".into() },
            ConversationTurn::AssistantToolCalls {
                content: String::new(),
                tool_calls: vec![
                    ToolCallRequest { id: "a".into(), name: "x".into(), arguments: json!({}) },
                    ToolCallRequest { id: "b".into(), name: "y".into(), arguments: json!({}) },
                ],
            },
            ConversationTurn::ToolResult { tool_call_id: "a".into(), name: None, content: "1".into() },
            ConversationTurn::ToolResult { tool_call_id: "b".into(), name: None, content: "2".into() },
        ];
        let msgs = to_anthropic_messages(&convo);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1]["content"][1]["type"], "tool_use");
        assert_eq!(msgs[2]["role"], "user");
        assert_eq!(msgs[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(msgs[2]["content"][1]["tool_use_id"], "b");
    }

    #[test]
    fn text_block_precedes_tool_use() {
        let msgs = to_anthropic_messages(&[ConversationTurn::AssistantToolCalls {
            content: "Checking.".into(),
            tool_calls: vec![ToolCallRequest { id: "t".into(), name: "clock".into(), arguments: json!({}) }],
        }]);
        assert_eq!(msgs[0]["content"][0], json!({"type": "text", "text": "Checking."}));
        assert_eq!(msgs[0]["content"][1]["type"], "tool_use");
    }

    // ── http ──

    fn sse_body(events: &[(&str, Value)]) -> String {
        events
            .iter()
            .map(|(e, d)| format!("event: {e}\ndata: {d}\n\n"))
            .collect()
    }

    fn adapter(server: &MockServer) -> AnthropicAdapter {
        AnthropicAdapter::new(
            AnthropicConfig::new("claude-test", SecretString::from("key".to_string()))
                .with_base_url(server.uri()),
        )
    }

    async fn run(adapter: &AnthropicAdapter) -> Vec<ProviderEvent> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let mut sink = EventSink::new(move |e| out.lock().push(e));
        adapter
            .invoke(
                &[ConversationTurn::User { content: "hi".into() }],
                &[],
                &InvokePolicy::default(),
                &mut sink,
            )
            .await
            .unwrap();
        let events = seen.lock().clone();
        events
    }

    #[tokio::test]
    async fn streams_over_http_with_headers() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "ok"}})),
            ("message_stop", json!({"type": "message_stop"})),
        ]);
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        assert_eq!(
            run(&adapter(&server)).await,
            vec![
                ProviderEvent::AssistantDelta("ok".into()),
                ProviderEvent::AssistantFinal("ok".into()),
            ]
        );
    }

    #[tokio::test]
    async fn non_2xx_becomes_diagnostic_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let events = run(&adapter(&server)).await;
        assert_eq!(events.len(), 1);
        let ProviderEvent::AssistantFinal(text) = &events[0] else {
            panic!("expected final, got {events:?}");
        };
        assert!(text.starts_with("[provider error: authentication_failed]"));
    }

    #[tokio::test]
    async fn stream_without_message_stop_still_terminates() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "par"}})),
            ("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "tial"}})),
        ]);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        assert_eq!(
            run(&adapter(&server)).await,
            vec![
                ProviderEvent::AssistantDelta("par".into()),
                ProviderEvent::AssistantDelta("tial".into()),
                ProviderEvent::AssistantFinal("partial".into()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_stream_ends_with_empty_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/event-stream"))
            .mount(&server)
            .await;

        assert_eq!(
            run(&adapter(&server)).await,
            vec![ProviderEvent::AssistantFinal(String::new())]
        );
    }
}
