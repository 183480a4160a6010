//! Front ends that feed the bus and render what comes back.

use std::sync::Arc;

use async_trait::async_trait;
use vsm_core::{Bus, Message, MessageKind, SubscriptionId};

use crate::capsule::Capsule;
use crate::error::RuntimeError;

#[async_trait]
pub trait Port: Send + Sync {
    fn name(&self) -> &str;

    fn should_render(&self, message: &Message) -> bool {
        matches!(message.kind, MessageKind::Assistant | MessageKind::ToolResult)
    }

    fn render_out(&self, message: &Message);

    /// Ports that must see every selected message, even under a burst,
    /// get an unbounded subscription.
    fn lossless(&self) -> bool {
        false
    }

    /// Ingress loop. Ports that only render return immediately.
    async fn run(&self, _capsule: Arc<Capsule>) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Subscribe `port` so it renders every message it selects.
pub fn egress_subscribe(port: Arc<dyn Port>, bus: &Bus) -> SubscriptionId {
    let lossless = port.lossless();
    let render = move |message: Message| {
        if port.should_render(&message) {
            port.render_out(&message);
        }
    };
    if lossless {
        bus.subscribe_lossless(render)
    } else {
        bus.subscribe(render)
    }
}
