use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::ids::SubscriptionId;
use crate::message::Message;
use crate::registry::ToolRegistry;
use crate::tools::{Tool, ToolDescriptor};

/// Default bound of each subscriber's delivery queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Shared asynchronous channel: one dispatch queue plus fan-out to subscribers.
///
/// Cloning is cheap; all clones address the same bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    dispatch_tx: mpsc::UnboundedSender<Message>,
    dispatch_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    subscriber_capacity: usize,
    context: BusContext,
}

struct Subscriber {
    id: SubscriptionId,
    tx: SubscriberTx,
}

enum SubscriberTx {
    Bounded(mpsc::Sender<Message>),
    Unbounded(mpsc::UnboundedSender<Message>),
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(subscriber_capacity: usize) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                dispatch_tx,
                dispatch_rx: tokio::sync::Mutex::new(dispatch_rx),
                subscribers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                subscriber_capacity: subscriber_capacity.max(1),
                context: BusContext::default(),
            }),
        }
    }

    /// Enqueue for the dispatch loop, then notify every current subscriber.
    /// Never blocks; a full or closed subscriber queue drops its copy.
    pub fn emit(&self, message: Message) {
        let subscribers = self.inner.subscribers.read();
        for sub in subscribers.iter() {
            match &sub.tx {
                SubscriberTx::Bounded(tx) => match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(subscription = %sub.id, kind = %message.kind, "subscriber queue full, dropping message");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(subscription = %sub.id, "subscriber closed");
                    }
                },
                SubscriberTx::Unbounded(tx) => {
                    if tx.send(message.clone()).is_err() {
                        debug!(subscription = %sub.id, "subscriber closed");
                    }
                }
            }
        }
        drop(subscribers);

        if self.inner.dispatch_tx.send(message).is_err() {
            debug!("dispatch queue closed, message dropped");
        }
    }

    /// Next message for the dispatch loop.
    pub async fn pop(&self) -> Option<Message> {
        self.inner.dispatch_rx.lock().await.recv().await
    }

    /// Subscribe with a bounded channel. The receiver sees every message
    /// emitted after this call while it keeps up.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.inner.subscriber_capacity);
        let id = self.push_subscriber(SubscriberTx::Bounded(tx));
        (id, rx)
    }

    /// Subscribe without a bound. Nothing is ever dropped for this receiver,
    /// so it must keep draining.
    pub fn subscribe_unbounded_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.push_subscriber(SubscriberTx::Unbounded(tx));
        (id, rx)
    }

    /// Subscribe a callback. Delivery runs on its own task, in emit order;
    /// a panicking callback is logged and skipped. Requires a tokio runtime.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (id, mut rx) = self.subscribe_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                deliver(id, &callback, message);
            }
        });
        id
    }

    /// Like [`Bus::subscribe`], but the callback never misses a message.
    pub fn subscribe_lossless<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (id, mut rx) = self.subscribe_unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                deliver(id, &callback, message);
            }
        });
        id
    }

    fn push_subscriber(&self, tx: SubscriberTx) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push(Subscriber { id, tx });
        id
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn context(&self) -> &BusContext {
        &self.inner.context
    }
}

fn deliver(id: SubscriptionId, callback: &impl Fn(Message), message: Message) {
    let kind = message.kind.clone();
    if std::panic::catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
        warn!(subscription = %id, %kind, "subscriber callback panicked");
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared mutable state reachable from every collaborator holding the bus.
#[derive(Default)]
pub struct BusContext {
    operations_children: Arc<Mutex<ToolRegistry>>,
    values: Mutex<HashMap<String, Value>>,
}

impl BusContext {
    /// The tool inventory (`operations_children`).
    pub fn operations_children(&self) -> Arc<Mutex<ToolRegistry>> {
        Arc::clone(&self.operations_children)
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.operations_children.lock().get(name)
    }

    /// Snapshot of every registered descriptor, sorted by name.
    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.operations_children.lock().descriptors()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.lock().insert(key.into(), value)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }
}
