//! Ordering and turn-end signaling for one dispatch loop.
//!
//! Staged messages are sorted by a fixed priority key on every drain. A
//! session granted the floor gets one step of priority over everyone else.
//! Callers block on a per-session counting semaphore that gains one permit
//! for every `assistant` message drained for that session.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};
use vsm_core::{Message, MessageKind, SessionId};

#[derive(Default)]
pub struct Coordinator {
    staged: Mutex<Vec<Message>>,
    floor: Mutex<Option<SessionId>>,
    turn_waiters: Mutex<HashMap<SessionId, Arc<Semaphore>>>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, message: Message) {
        self.staged.lock().push(message);
    }

    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }

    /// Sort everything staged, empty the buffer and hand each message to
    /// `yield_message` in order. After an `assistant` message the waiter
    /// queue of its session, if one exists, gains one release.
    pub fn drain(&self, mut yield_message: impl FnMut(Message)) {
        let mut batch = std::mem::take(&mut *self.staged.lock());
        if batch.is_empty() {
            return;
        }
        let floor = self.floor.lock().clone();
        batch.sort_by_key(|m| order_key(m, floor.as_ref()));
        trace!(count = batch.len(), "draining staged messages");

        for message in batch {
            let turn_end = (message.kind == MessageKind::Assistant)
                .then(|| message.session_id().cloned())
                .flatten();
            yield_message(message);
            if let Some(sid) = turn_end {
                self.release(&sid);
            }
        }
    }

    /// Last caller wins. Never revoked automatically.
    pub fn grant_floor(&self, session_id: SessionId) {
        debug!(session_id = %session_id, "floor granted");
        *self.floor.lock() = Some(session_id);
    }

    pub fn floor(&self) -> Option<SessionId> {
        self.floor.lock().clone()
    }

    /// Create the session's waiter queue ahead of time so a turn end that
    /// lands before `wait_for_turn_end` is not lost.
    pub fn register_turn(&self, session_id: &SessionId) {
        let _ = self.waiter(session_id);
    }

    /// Block until one turn end for `session_id` is available, then consume it.
    pub async fn wait_for_turn_end(&self, session_id: &SessionId) {
        let queue = self.waiter(session_id);
        let acquired = queue.acquire().await;
        if let Ok(permit) = acquired {
            permit.forget();
        }
    }

    /// Turn ends queued but not yet consumed.
    pub fn pending_turn_ends(&self, session_id: &SessionId) -> usize {
        self.turn_waiters
            .lock()
            .get(session_id)
            .map_or(0, |q| q.available_permits())
    }

    fn waiter(&self, session_id: &SessionId) -> Arc<Semaphore> {
        Arc::clone(
            self.turn_waiters
                .lock()
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(0))),
        )
    }

    fn release(&self, session_id: &SessionId) {
        if let Some(queue) = self.turn_waiters.lock().get(session_id) {
            queue.add_permits(1);
            trace!(session_id = %session_id, "turn end released");
        }
    }
}

fn base_priority(kind: &MessageKind) -> i32 {
    match kind {
        MessageKind::User => 0,
        MessageKind::ToolResult => 1,
        MessageKind::Plan => 2,
        MessageKind::AssistantDelta => 3,
        MessageKind::Assistant => 4,
        _ => 9,
    }
}

/// Lower sorts first. The floor holder's messages gain one step.
pub fn order_key(message: &Message, floor: Option<&SessionId>) -> i32 {
    let base = base_priority(&message.kind);
    match (message.session_id(), floor) {
        (Some(sid), Some(holder)) if sid == holder => base - 1,
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vsm_core::Meta;

    fn msg(kind: MessageKind, sid: &str) -> Message {
        Message::new(kind, serde_json::Value::Null)
            .with_meta(Meta::for_session(SessionId::from_raw(sid)))
    }

    fn drained(c: &Coordinator) -> Vec<Message> {
        let mut out = Vec::new();
        c.drain(|m| out.push(m));
        out
    }

    // ── ordering ──

    #[test]
    fn drain_orders_by_kind() {
        let c = Coordinator::new();
        c.stage(msg(MessageKind::ToolResult, "s"));
        c.stage(msg(MessageKind::Assistant, "s"));
        c.stage(msg(MessageKind::User, "s"));
        let kinds: Vec<_> = drained(&c).into_iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MessageKind::User, MessageKind::ToolResult, MessageKind::Assistant]
        );
        assert_eq!(c.staged_len(), 0);
    }

    #[test]
    fn ties_keep_arrival_order() {
        let c = Coordinator::new();
        for i in 0..5 {
            c.stage(
                Message::new(MessageKind::AssistantDelta, i)
                    .with_meta(Meta::for_session(SessionId::from_raw("s"))),
            );
        }
        let payloads: Vec<_> = drained(&c).into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, (0..5).map(serde_json::Value::from).collect::<Vec<_>>());
    }

    #[test]
    fn unknown_kinds_sort_last() {
        let c = Coordinator::new();
        c.stage(Message::new(MessageKind::Progress, "p"));
        c.stage(Message::new(MessageKind::Other("custom".into()), "x"));
        c.stage(msg(MessageKind::Assistant, "s"));
        let kinds: Vec<_> = drained(&c).into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds[0], MessageKind::Assistant);
    }

    #[test]
    fn sessionless_messages_get_no_floor_bonus() {
        assert_eq!(order_key(&Message::new(MessageKind::User, "x"), None), 0);
        let floor = SessionId::from_raw("a");
        assert_eq!(order_key(&Message::new(MessageKind::User, "x"), Some(&floor)), 0);
    }

    // ── floor ──

    #[test]
    fn floor_holder_goes_first() {
        let c = Coordinator::new();
        c.grant_floor(SessionId::from_raw("b"));
        c.stage(msg(MessageKind::Assistant, "a"));
        c.stage(msg(MessageKind::Assistant, "b"));
        let sids: Vec<_> = drained(&c)
            .into_iter()
            .map(|m| m.session_id().cloned().unwrap())
            .collect();
        assert_eq!(sids, vec![SessionId::from_raw("b"), SessionId::from_raw("a")]);
    }

    #[test]
    fn last_grant_wins() {
        let c = Coordinator::new();
        c.grant_floor(SessionId::from_raw("a"));
        c.grant_floor(SessionId::from_raw("b"));
        assert_eq!(c.floor(), Some(SessionId::from_raw("b")));
    }

    #[test]
    fn floor_holder_starves_background_session() {
        // Known behaviour: no fairness. Under sustained floor-holder traffic a
        // background session's same-kind messages always drain last.
        let c = Coordinator::new();
        c.grant_floor(SessionId::from_raw("fg"));
        for round in 0..3 {
            c.stage(msg(MessageKind::AssistantDelta, "bg"));
            for _ in 0..4 {
                c.stage(msg(MessageKind::AssistantDelta, "fg"));
            }
            let out = drained(&c);
            assert_eq!(
                out.last().and_then(|m| m.session_id().cloned()),
                Some(SessionId::from_raw("bg")),
                "round {round}"
            );
        }
        assert!(
            order_key(&msg(MessageKind::Assistant, "fg"), Some(&SessionId::from_raw("fg")))
                < order_key(&msg(MessageKind::Assistant, "bg"), Some(&SessionId::from_raw("fg")))
        );
    }

    // ── turn end ──

    #[tokio::test]
    async fn waiter_released_once_per_assistant() {
        let c = Arc::new(Coordinator::new());
        let sid = SessionId::from_raw("s");
        c.register_turn(&sid);

        c.stage(msg(MessageKind::Assistant, "s"));
        drained(&c);

        tokio::time::timeout(Duration::from_secs(1), c.wait_for_turn_end(&sid))
            .await
            .expect("released");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), c.wait_for_turn_end(&sid))
                .await
                .is_err(),
            "second wait must block"
        );
    }

    #[tokio::test]
    async fn other_sessions_do_not_release() {
        let c = Coordinator::new();
        let sid = SessionId::from_raw("mine");
        c.register_turn(&sid);
        c.stage(msg(MessageKind::Assistant, "other"));
        c.stage(msg(MessageKind::AssistantDelta, "mine"));
        drained(&c);
        assert_eq!(c.pending_turn_ends(&sid), 0);
    }

    #[tokio::test]
    async fn concurrent_waiters_each_need_a_turn() {
        let c = Arc::new(Coordinator::new());
        let sid = SessionId::from_raw("s");
        c.register_turn(&sid);

        let w1 = tokio::spawn({
            let (c, sid) = (Arc::clone(&c), sid.clone());
            async move { c.wait_for_turn_end(&sid).await }
        });
        let w2 = tokio::spawn({
            let (c, sid) = (Arc::clone(&c), sid.clone());
            async move { c.wait_for_turn_end(&sid).await }
        });
        tokio::task::yield_now().await;

        c.stage(msg(MessageKind::Assistant, "s"));
        drained(&c);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            [w1.is_finished(), w2.is_finished()].iter().filter(|f| **f).count(),
            1
        );

        c.stage(msg(MessageKind::Assistant, "s"));
        drained(&c);
        tokio::time::timeout(Duration::from_secs(1), async {
            let _ = w1.await;
            let _ = w2.await;
        })
        .await
        .expect("both released");
    }

    #[tokio::test]
    async fn unregistered_session_drops_signal() {
        let c = Coordinator::new();
        c.stage(msg(MessageKind::Assistant, "s"));
        drained(&c);
        assert_eq!(c.pending_turn_ends(&SessionId::from_raw("s")), 0);
    }
}
