//! Per-session multi-turn tool-calling state machine.
//!
//! `idle → invoking → {awaiting_tools | idle}`. A session invokes the
//! provider only when nothing is in flight and no tool result is pending.
//! Sessions are created on first `user` message and live for the process.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use vsm_core::{
    Bus, ConversationTurn, EventSink, Handler, InvokePolicy, Message, MessageKind, Meta,
    ProviderAdapter, ProviderEvent, SessionId, ToolCallRequest, ToolDescriptor,
};

/// Deployment hooks consulted on every invocation.
pub trait SessionHooks: Send + Sync {
    fn system_prompt(&self, _session_id: &SessionId) -> Option<String> {
        None
    }

    /// Whether `descriptor` is offered to the model for this session.
    fn offer_tool(&self, _session_id: &SessionId, _descriptor: &ToolDescriptor) -> bool {
        true
    }
}

/// Same system prompt for every session; every tool offered.
#[derive(Clone, Debug, Default)]
pub struct StaticPrompt(pub Option<String>);

impl SessionHooks for StaticPrompt {
    fn system_prompt(&self, _session_id: &SessionId) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    history: Vec<ConversationTurn>,
    pending_tool_ids: HashSet<String>,
    tool_id_to_name: HashMap<String, String>,
    inflight: bool,
    turn_seq: u64,
    /// User input that arrived mid-turn, appended at the next invocation.
    deferred: Vec<String>,
}

impl SessionState {
    fn busy(&self) -> bool {
        self.inflight || !self.pending_tool_ids.is_empty()
    }

    fn finish_turn(&mut self, turn_id: u64) {
        if self.turn_seq == turn_id {
            self.inflight = false;
        }
    }
}

type SharedState = Arc<Mutex<SessionState>>;

struct Inner {
    provider: Arc<dyn ProviderAdapter>,
    hooks: Arc<dyn SessionHooks>,
    policy: InvokePolicy,
    sessions: DashMap<SessionId, SharedState>,
}

/// The intelligence role: turns `user` and `tool_result` messages into
/// provider invocations and re-emits what the provider says.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(provider: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                hooks: Arc::new(StaticPrompt::default()),
                policy: InvokePolicy::default(),
                sessions: DashMap::new(),
            }),
        }
    }

    /// Replace the hooks. Call before the orchestrator is shared.
    pub fn with_hooks(self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.rebuild(|inner| inner.hooks = hooks)
    }

    /// Base policy. The system prompt from the hooks, if any, wins.
    pub fn with_policy(self, policy: InvokePolicy) -> Self {
        self.rebuild(|inner| inner.policy = policy)
    }

    fn rebuild(self, apply: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = Inner {
            provider: Arc::clone(&self.inner.provider),
            hooks: Arc::clone(&self.inner.hooks),
            policy: self.inner.policy.clone(),
            sessions: DashMap::new(),
        };
        apply(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn history(&self, session_id: &SessionId) -> Vec<ConversationTurn> {
        self.read(session_id, |s| s.history.clone()).unwrap_or_default()
    }

    pub fn is_inflight(&self, session_id: &SessionId) -> bool {
        self.read(session_id, |s| s.inflight).unwrap_or(false)
    }

    pub fn pending_tool_ids(&self, session_id: &SessionId) -> Vec<String> {
        let mut ids = self
            .read(session_id, |s| s.pending_tool_ids.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn turn_seq(&self, session_id: &SessionId) -> u64 {
        self.read(session_id, |s| s.turn_seq).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn read<T>(&self, session_id: &SessionId, f: impl FnOnce(&SessionState) -> T) -> Option<T> {
        let state = self.inner.sessions.get(session_id).map(|e| Arc::clone(e.value()))?;
        let guard = state.lock();
        Some(f(&guard))
    }

    fn on_user(&self, message: &Message, bus: &Bus) -> bool {
        let Some(sid) = message.session_id() else {
            return false;
        };
        let state = self.inner.session(sid);
        let text = message.payload_text();
        {
            let mut st = state.lock();
            if st.busy() {
                debug!(session_id = %sid, "turn in progress, deferring user input");
                st.deferred.push(text);
                return true;
            }
            st.history.push(ConversationTurn::User { content: text });
        }
        self.inner.attempt_invocation(sid, &state, bus);
        true
    }

    fn on_tool_result(&self, message: &Message, bus: &Bus) -> bool {
        let (Some(sid), Some(call_id)) = (message.session_id(), message.corr_id.as_deref()) else {
            return false;
        };
        let Some(state) = self.inner.sessions.get(sid).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        {
            let mut st = state.lock();
            if !st.pending_tool_ids.remove(call_id) {
                return false;
            }
            let name = st.tool_id_to_name.get(call_id).cloned();
            st.history.push(ConversationTurn::ToolResult {
                tool_call_id: call_id.to_string(),
                name,
                content: message.payload_text(),
            });
            if !st.pending_tool_ids.is_empty() {
                debug!(
                    session_id = %sid,
                    remaining = st.pending_tool_ids.len(),
                    "waiting for remaining tool results"
                );
                return true;
            }
        }
        self.inner.attempt_invocation(sid, &state, bus);
        true
    }
}

impl Handler for SessionOrchestrator {
    fn handle(&self, message: &Message, bus: &Bus) -> bool {
        match message.kind {
            MessageKind::User => self.on_user(message, bus),
            MessageKind::ToolResult => self.on_tool_result(message, bus),
            _ => false,
        }
    }
}

impl Inner {
    /// Get-or-insert under the map's shard lock.
    fn session(&self, session_id: &SessionId) -> SharedState {
        Arc::clone(
            self.sessions
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::default())))
                .value(),
        )
    }

    fn attempt_invocation(self: &Arc<Self>, session_id: &SessionId, state: &SharedState, bus: &Bus) {
        let (turn_id, conversation) = {
            let mut st = state.lock();
            if st.busy() {
                debug!(
                    session_id = %session_id,
                    inflight = st.inflight,
                    pending = st.pending_tool_ids.len(),
                    "invocation skipped"
                );
                return;
            }
            for text in std::mem::take(&mut st.deferred) {
                st.history.push(ConversationTurn::User { content: text });
            }
            st.inflight = true;
            st.turn_seq += 1;
            (st.turn_seq, st.history.clone())
        };

        let tools: Vec<ToolDescriptor> = bus
            .context()
            .tool_descriptors()
            .into_iter()
            .filter(|d| self.hooks.offer_tool(session_id, d))
            .collect();
        let mut policy = self.policy.clone();
        if let Some(prompt) = self.hooks.system_prompt(session_id) {
            policy.system_prompt = Some(prompt);
        }

        info!(
            session_id = %session_id,
            turn_id,
            turns = conversation.len(),
            tools = tools.len(),
            provider = self.provider.name(),
            "invoking provider"
        );
        let inner = Arc::clone(self);
        let session_id = session_id.clone();
        let state = Arc::clone(state);
        let bus = bus.clone();
        let _ = tokio::spawn(async move {
            inner
                .run_turn(session_id, state, turn_id, conversation, tools, policy, bus)
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn(
        self: Arc<Self>,
        session_id: SessionId,
        state: SharedState,
        turn_id: u64,
        conversation: Vec<ConversationTurn>,
        tools: Vec<ToolDescriptor>,
        policy: InvokePolicy,
        bus: Bus,
    ) {
        {
            let mut streamed = String::new();
            let mut sink = EventSink::new(|event| {
                self.on_event(&session_id, &state, turn_id, &bus, &mut streamed, event);
            });
            let outcome = AssertUnwindSafe(self.provider.invoke(
                &conversation,
                &tools,
                &policy,
                &mut sink,
            ))
            .catch_unwind()
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(session_id = %session_id, turn_id, error = %e, "provider invocation failed");
                    sink.final_text(e.diagnostic());
                }
                Err(_) => {
                    warn!(session_id = %session_id, turn_id, "provider invocation panicked");
                    sink.final_text("[provider error: panicked] adapter panicked");
                }
            }
            sink.finish();
        }
        let has_deferred = {
            let mut st = state.lock();
            st.finish_turn(turn_id);
            !st.deferred.is_empty()
        };
        if has_deferred {
            self.attempt_invocation(&session_id, &state, &bus);
        }
    }

    fn on_event(
        &self,
        session_id: &SessionId,
        state: &SharedState,
        turn_id: u64,
        bus: &Bus,
        streamed: &mut String,
        event: ProviderEvent,
    ) {
        let meta = Meta::for_session(session_id.clone()).with_turn(turn_id);
        match event {
            ProviderEvent::AssistantDelta(text) => {
                streamed.push_str(&text);
                bus.emit(Message::new(MessageKind::AssistantDelta, Value::String(text)).with_meta(meta));
            }
            ProviderEvent::AssistantFinal(text) => {
                if !text.is_empty() {
                    state.lock().history.push(ConversationTurn::Assistant {
                        content: text.clone(),
                    });
                }
                debug!(session_id = %session_id, turn_id, chars = text.len(), "turn complete");
                bus.emit(Message::new(MessageKind::Assistant, Value::String(text)).with_meta(meta));
            }
            ProviderEvent::ToolCalls(calls) => {
                {
                    let mut st = state.lock();
                    st.history.push(ConversationTurn::AssistantToolCalls {
                        content: std::mem::take(streamed),
                        tool_calls: calls.clone(),
                    });
                    st.pending_tool_ids = calls.iter().map(|c| c.id.clone()).collect();
                    for call in &calls {
                        let _ = st.tool_id_to_name.insert(call.id.clone(), call.name.clone());
                    }
                    st.finish_turn(turn_id);
                }
                debug!(session_id = %session_id, turn_id, count = calls.len(), "tool calls queued");
                for ToolCallRequest { id, name, arguments } in calls {
                    bus.emit(Message::tool_call(name, arguments, id, meta.clone()));
                }
            }
        }
    }
}
