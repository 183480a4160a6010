//! Gemini `generateContent` adapter.
//!
//! Non-streaming: the whole response arrives in one body. Function calls
//! become one `ToolCalls` event; otherwise the text is delivered as a
//! single delta followed by the final.

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;
use vsm_core::{
    ConversationTurn, EventSink, InvokePolicy, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderFamily, ToolCallRequest, ToolDescriptor,
};

use crate::transport;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub model: String,
    pub api_key: SecretString,
    pub base_url: String,
    pub max_tokens: Option<u32>,
}

impl GeminiConfig {
    pub fn new(model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            model: model.into(),
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
            max_tokens: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

pub struct GeminiAdapter {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(config: GeminiConfig) -> Self {
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
        let mut body = json!({ "contents": to_gemini_contents(conversation) });
        if let Some(system) = policy.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !tools.is_empty() {
            let decls: Vec<Value> = tools.iter().map(ToolDescriptor::to_gemini_tool).collect();
            body["tools"] = json!([{ "function_declarations": decls }]);
        }
        let mut generation = serde_json::Map::new();
        if let Some(max) = policy.max_tokens.or(self.config.max_tokens) {
            let _ = generation.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(t) = policy.temperature {
            let _ = generation.insert("temperature".into(), json!(t));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }

    async fn generate(&self, body: &Value) -> Result<Value, ProviderError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let request = self
            .client
            .post(url)
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(body);
        let response = transport::send(request).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    #[instrument(skip_all, fields(provider = "gemini", model = %self.config.model))]
    async fn invoke(
        &self,
        conversation: &[ConversationTurn],
        tools: &[ToolDescriptor],
        policy: &InvokePolicy,
        sink: &mut EventSink<'_>,
    ) -> Result<(), ProviderError> {
        let body = self.build_body(conversation, tools, policy);
        debug!(turns = conversation.len(), tools = tools.len(), "sending request");
        let outcome = self.generate(&body).await.and_then(|response| {
            for event in parse_generate_response(&response)? {
                sink.emit(event);
            }
            Ok(())
        });
        transport::conclude("gemini", outcome, sink);
        Ok(())
    }
}

/// Neutral conversation → `contents`.
pub fn to_gemini_contents(conversation: &[ConversationTurn]) -> Vec<Value> {
    let mut names_by_id: HashMap<&str, &str> = HashMap::new();
    let mut contents = Vec::with_capacity(conversation.len());
    for turn in conversation {
        contents.push(match turn {
            ConversationTurn::User { content } => {
                json!({"role": "user", "parts": [{"text": content}]})
            }
            ConversationTurn::Assistant { content } => {
                json!({"role": "model", "parts": [{"text": content}]})
            }
            ConversationTurn::AssistantToolCalls {
                content,
                tool_calls,
            } => {
                for c in tool_calls {
                    let _ = names_by_id.insert(c.id.as_str(), c.name.as_str());
                }
                let text = (!content.is_empty()).then(|| json!({"text": content}));
                let parts: Vec<Value> = text
                    .into_iter()
                    .chain(
                        tool_calls
                            .iter()
                            .map(|c| json!({"functionCall": {"name": c.name, "args": c.arguments}})),
                    )
                    .collect();
                json!({"role": "model", "parts": parts})
            }
            ConversationTurn::ToolResult {
                tool_call_id,
                name,
                content,
            } => {
                let name = name
                    .as_deref()
                    .or_else(|| names_by_id.get(tool_call_id.as_str()).copied())
                    .unwrap_or_default();
                json!({"role": "user", "parts": [{
                    "functionResponse": {"name": name, "response": {"content": content}}
                }]})
            }
        });
    }
    contents
}

/// Turn a `generateContent` body into terminal-ending events.
pub fn parse_generate_response(response: &Value) -> Result<Vec<ProviderEvent>, ProviderError> {
    if let Some(err) = response.get("error") {
        let message = err["message"].as_str().unwrap_or("unknown error");
        return Err(ProviderError::InvalidRequest(message.to_string()));
    }
    let parts = response["candidates"][0]["content"]["parts"]
        .as_array()
        .cloned()
        .unwrap_or_default();

    let calls: Vec<ToolCallRequest> = parts
        .iter()
        .filter_map(|p| p.get("functionCall"))
        .map(|fc| ToolCallRequest {
            id: fc["id"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", Uuid::now_v7())),
            name: fc["name"].as_str().unwrap_or_default().to_string(),
            arguments: match &fc["args"] {
                Value::Null => json!({}),
                args => args.clone(),
            },
        })
        .collect();
    if !calls.is_empty() {
        return Ok(vec![ProviderEvent::ToolCalls(calls)]);
    }

    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();
    let mut events = Vec::with_capacity(2);
    if !text.is_empty() {
        events.push(ProviderEvent::AssistantDelta(text.clone()));
    }
    events.push(ProviderEvent::AssistantFinal(text));
    Ok(events)
}
