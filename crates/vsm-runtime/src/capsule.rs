//! The composition root: one bus, one dispatch loop, the roles, and the
//! tool children.
//!
//! Each loop iteration pops one message, stages it in the coordinator and
//! drains. Every drained message goes through the alarm check, then
//! governance, then the route chain: operations → intelligence → identity.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};
use vsm_core::{Bus, Governance, Handler, Identity, Message, SessionId};

use crate::coordinator::Coordinator;
use crate::dispatcher::ToolDispatcher;
use crate::error::RuntimeError;
use crate::homeostat::Homeostat;

pub struct Capsule {
    pub(crate) name: String,
    pub(crate) bus: Bus,
    pub(crate) coordinator: Coordinator,
    pub(crate) homeostat: Arc<Homeostat>,
    pub(crate) identity: Arc<dyn Identity>,
    pub(crate) governance: Arc<dyn Governance>,
    pub(crate) operations: ToolDispatcher,
    pub(crate) intelligence: Option<Arc<dyn Handler>>,
}

impl Capsule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn homeostat(&self) -> &Arc<Homeostat> {
        &self.homeostat
    }

    pub fn governance(&self) -> Arc<dyn Governance> {
        Arc::clone(&self.governance)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.bus.context().operations_children().lock().names()
    }

    /// Alarm check, then governance, then the route chain.
    pub fn dispatch(&self, message: Message) {
        if self.homeostat.alarm(&message) {
            self.identity.alert(&message);
            return;
        }
        self.governance.enforce(
            message,
            Box::new(|m| {
                let _ = self.route(m);
            }),
        );
    }

    fn route(&self, message: Message) -> bool {
        let bus = &self.bus;
        let handled = self.operations.handle(&message, bus)
            || self
                .intelligence
                .as_ref()
                .is_some_and(|i| i.handle(&message, bus))
            || self.identity.handle(&message, bus);
        if !handled {
            trace!(kind = %message.kind, "message not handled by any role");
        }
        handled
    }

    /// Stage one message and drain everything staged.
    pub fn step(&self, message: Message) {
        self.coordinator.stage(message);
        self.coordinator.drain(|m| self.dispatch(m));
    }

    /// The dispatch loop. Runs until the bus is dropped.
    pub async fn run(self: Arc<Self>) {
        info!(capsule = %self.name, "dispatch loop started");
        while let Some(message) = self.bus.pop().await {
            self.step(message);
        }
        debug!(capsule = %self.name, "dispatch loop ended");
    }

    pub fn grant_floor(&self, session_id: SessionId) {
        self.coordinator.grant_floor(session_id);
    }

    /// Emit a user message and block until that session's turn ends.
    /// Waits forever if nothing ever answers with an `assistant` message.
    pub async fn ask(&self, session_id: &SessionId, text: impl Into<String>) {
        self.coordinator.register_turn(session_id);
        self.bus.emit(Message::user(session_id.clone(), text));
        self.coordinator.wait_for_turn_end(session_id).await;
    }

    pub async fn ask_with_timeout(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        tokio::time::timeout(timeout, self.ask(session_id, text))
            .await
            .map_err(|_| RuntimeError::TurnTimeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CapsuleBuilder;
    use crate::orchestrator::SessionOrchestrator;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use vsm_core::{
        Continuation, ExecutionPolicy, MessageKind, Meta, ProviderAdapter, Tool, ToolDescriptor,
        ToolError, ALGEDONIC,
    };
    use vsm_llm::{MockAdapter, MockResponse};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new(
                "echo",
                "Echo text back",
                json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            )
        }
        async fn run(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args["text"].clone())
        }
    }

    struct Kapow;

    #[async_trait]
    impl Tool for Kapow {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("kapow", "Always fails", json!({"type": "object"}))
        }
        fn execution_policy(&self) -> ExecutionPolicy {
            ExecutionPolicy::Isolated
        }
        async fn run(&self, _args: Value) -> Result<Value, ToolError> {
            Err(ToolError::ExecutionFailed("kapow".into()))
        }
    }

    #[derive(Default)]
    struct RecordingIdentity {
        alerts: Mutex<Vec<Message>>,
        fallback: Mutex<Vec<Message>>,
    }

    impl Identity for RecordingIdentity {
        fn alert(&self, message: &Message) {
            self.alerts.lock().push(message.clone());
        }
        fn handle(&self, message: &Message, _bus: &Bus) -> bool {
            self.fallback.lock().push(message.clone());
            false
        }
    }

    struct VetoUser;

    impl Governance for VetoUser {
        fn enforce(&self, message: Message, next: Continuation<'_>) {
            if message.kind != MessageKind::User {
                next(message);
            }
        }
    }

    fn capsule_with(responses: Vec<MockResponse>) -> (Arc<Capsule>, Arc<MockAdapter>) {
        let mock = Arc::new(MockAdapter::new(responses));
        let orch = SessionOrchestrator::new(Arc::clone(&mock) as Arc<dyn ProviderAdapter>);
        let capsule = CapsuleBuilder::new("test")
            .intelligence(Arc::new(orch))
            .tool(Arc::new(Echo))
            .tool(Arc::new(Kapow))
            .build();
        let _ = tokio::spawn(Arc::clone(&capsule).run());
        (capsule, mock)
    }

    async fn collect_until(rx: &mut mpsc::Receiver<Message>, kind: MessageKind) -> Vec<Message> {
        let mut seen = Vec::new();
        loop {
            let m = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("bus closed");
            let done = m.kind == kind;
            seen.push(m);
            if done {
                return seen;
            }
        }
    }

    // ── turns ──

    #[tokio::test]
    async fn ask_returns_after_assistant() {
        let (capsule, _) = capsule_with(vec![MockResponse::text("hi there")]);
        let (_, mut rx) = capsule.bus().subscribe_channel();
        let sid = SessionId::from_raw("s1");
        capsule
            .ask_with_timeout(&sid, "hello", Duration::from_secs(2))
            .await
            .unwrap();
        let seen = collect_until(&mut rx, MessageKind::Assistant).await;
        let kinds: Vec<_> = seen.iter().map(|m| m.kind.clone()).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::User, MessageKind::AssistantDelta, MessageKind::Assistant]
        );
    }

    #[tokio::test]
    async fn tool_round_through_the_loop() {
        let (capsule, mock) = capsule_with(vec![
            MockResponse::tool_call("c1", "echo", json!({"text": "ping"})),
            MockResponse::text("pong"),
        ]);
        let (_, mut rx) = capsule.bus().subscribe_channel();
        let sid = SessionId::from_raw("s1");
        capsule
            .ask_with_timeout(&sid, "use echo", Duration::from_secs(2))
            .await
            .unwrap();
        let seen = collect_until(&mut rx, MessageKind::Assistant).await;
        let result = seen.iter().find(|m| m.kind == MessageKind::ToolResult).unwrap();
        assert_eq!(result.payload, json!("ping"));
        assert_eq!(result.corr_id.as_deref(), Some("c1"));
        assert_eq!(mock.tools_offered()[0], vec!["echo", "kapow"]);
    }

    #[tokio::test]
    async fn tool_failure_still_reaches_assistant() {
        let (capsule, mock) = capsule_with(vec![
            MockResponse::tool_call("c1", "kapow", json!({})),
            MockResponse::text("sorry"),
        ]);
        let (_, mut rx) = capsule.bus().subscribe_channel();
        let sid = SessionId::from_raw("s1");
        capsule
            .ask_with_timeout(&sid, "break it", Duration::from_secs(2))
            .await
            .unwrap();
        let seen = collect_until(&mut rx, MessageKind::Assistant).await;
        let result = seen.iter().find(|m| m.kind == MessageKind::ToolResult).unwrap();
        assert_eq!(result.payload, json!("ERROR: ExecutionFailed: kapow"));
        assert!(matches!(
            &mock.conversations()[1][2],
            vsm_core::ConversationTurn::ToolResult { content, .. } if content == "ERROR: ExecutionFailed: kapow"
        ));
    }

    #[tokio::test]
    async fn unknown_tool_from_model_is_answered() {
        let (capsule, _) = capsule_with(vec![
            MockResponse::tool_call("c1", "missing", json!({})),
            MockResponse::text("ok"),
        ]);
        let sid = SessionId::from_raw("s1");
        capsule
            .ask_with_timeout(&sid, "go", Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ask_without_intelligence_never_returns() {
        let capsule = CapsuleBuilder::new("tools-only").tool(Arc::new(Echo)).build();
        let _ = tokio::spawn(Arc::clone(&capsule).run());
        let err = capsule
            .ask_with_timeout(&SessionId::from_raw("s"), "anyone?", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::TurnTimeout(_)));
    }

    // ── pipeline ──

    #[tokio::test]
    async fn alarm_goes_to_identity_only() {
        let identity = Arc::new(RecordingIdentity::default());
        let capsule = CapsuleBuilder::new("alarm")
            .identity(Arc::clone(&identity) as Arc<dyn Identity>)
            .governance(Arc::new(VetoUser))
            .build();
        let alarm = Message::new(MessageKind::User, "smoke")
            .with_meta(Meta::default().with_severity(ALGEDONIC));
        capsule.step(alarm);
        assert_eq!(identity.alerts.lock().len(), 1);
        assert!(identity.fallback.lock().is_empty());
    }

    #[tokio::test]
    async fn governance_can_veto() {
        let identity = Arc::new(RecordingIdentity::default());
        let capsule = CapsuleBuilder::new("veto")
            .identity(Arc::clone(&identity) as Arc<dyn Identity>)
            .governance(Arc::new(VetoUser))
            .build();
        capsule.step(Message::user(SessionId::from_raw("s"), "hi"));
        capsule.step(Message::new(MessageKind::Audit, "note"));
        let fallback = identity.fallback.lock();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].kind, MessageKind::Audit);
    }

    #[tokio::test]
    async fn unknown_kinds_fall_through_silently() {
        let identity = Arc::new(RecordingIdentity::default());
        let capsule = CapsuleBuilder::new("drop")
            .identity(Arc::clone(&identity) as Arc<dyn Identity>)
            .build();
        capsule.step(Message::new(MessageKind::Other("telemetry".into()), json!({})));
        assert_eq!(identity.fallback.lock().len(), 1);
    }

    #[tokio::test]
    async fn operations_route_before_intelligence() {
        let (capsule, mock) = capsule_with(vec![]);
        let (_, mut rx) = capsule.bus().subscribe_channel();
        capsule.bus().emit(Message::tool_call(
            "echo",
            json!({"text": "direct"}),
            "d1",
            Meta::for_session(SessionId::from_raw("x")),
        ));
        let seen = collect_until(&mut rx, MessageKind::ToolResult).await;
        assert_eq!(seen.last().unwrap().payload, json!("direct"));
        assert_eq!(mock.call_count(), 0);
    }
}
