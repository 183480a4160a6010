use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use vsm_core::{
    ConversationTurn, EventSink, InvokePolicy, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderFamily, ToolCallRequest, ToolDescriptor,
};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Debug)]
pub enum MockResponse {
    /// Emit these events in order, yielding between them.
    Events(Vec<ProviderEvent>),
    /// Return this error without emitting anything.
    Error(ProviderError),
    /// Wait, then play the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Return without emitting a terminal event.
    Silent,
}

impl MockResponse {
    /// A single delta followed by the same text as final.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![
            ProviderEvent::AssistantDelta(text.to_string()),
            ProviderEvent::AssistantFinal(text.to_string()),
        ])
    }

    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        Self::Events(vec![ProviderEvent::ToolCalls(vec![ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }])])
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self::Events(vec![ProviderEvent::ToolCalls(calls)])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Adapter that plays pre-programmed responses in sequence and records
/// what it was asked.
pub struct MockAdapter {
    responses: Mutex<VecDeque<MockResponse>>,
    conversations: Mutex<Vec<Vec<ConversationTurn>>>,
    tools_offered: Mutex<Vec<Vec<String>>>,
    policies: Mutex<Vec<InvokePolicy>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAdapter {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            conversations: Mutex::new(Vec::new()),
            tools_offered: Mutex::new(Vec::new()),
            policies: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.conversations.lock().len()
    }

    /// Conversation snapshot passed to each invocation.
    pub fn conversations(&self) -> Vec<Vec<ConversationTurn>> {
        self.conversations.lock().clone()
    }

    /// Tool names offered to each invocation.
    pub fn tools_offered(&self) -> Vec<Vec<String>> {
        self.tools_offered.lock().clone()
    }

    pub fn policies(&self) -> Vec<InvokePolicy> {
        self.policies.lock().clone()
    }

    /// Highest number of invocations observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    async fn invoke(
        &self,
        conversation: &[ConversationTurn],
        tools: &[ToolDescriptor],
        policy: &InvokePolicy,
        sink: &mut EventSink<'_>,
    ) -> Result<(), ProviderError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        self.conversations.lock().push(conversation.to_vec());
        self.tools_offered
            .lock()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.policies.lock().push(policy.clone());

        let next = self.responses.lock().pop_front();
        let Some(mut response) = next else {
            return Err(ProviderError::InvalidRequest(format!(
                "mock: no response configured for call {}",
                self.call_count()
            )));
        };

        loop {
            match response {
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                MockResponse::Events(events) => {
                    for event in events {
                        sink.emit(event);
                        tokio::task::yield_now().await;
                    }
                    return Ok(());
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Silent => return Ok(()),
            }
        }
    }
}
