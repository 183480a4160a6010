//! Contracts between the capsule and its collaborators.
//!
//! Capabilities are explicit traits. A collaborator that wants the bus
//! implements [`Observable`]; a tool that wants the governance handle
//! implements [`Governable`]. The composition step asks for them through
//! `as_observable` / `as_governable` instead of probing for methods.

use std::sync::Arc;

use crate::bus::Bus;
use crate::message::Message;

/// Passes a message onward. Calling it is optional; not calling it vetoes.
pub type Continuation<'a> = Box<dyn FnOnce(Message) + Send + 'a>;

/// Policy gate every non-alarm message passes through.
pub trait Governance: Send + Sync {
    /// May inspect or annotate `message.meta`, then invoke `next` at most once.
    fn enforce(&self, message: Message, next: Continuation<'_>);
}

pub trait Identity: Send + Sync {
    /// Critical-severity interrupt path.
    fn alert(&self, message: &Message);

    /// Last route in the chain.
    fn handle(&self, _message: &Message, _bus: &Bus) -> bool {
        false
    }
}

/// A routing participant. Returns true when it took the message.
pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message, bus: &Bus) -> bool;

    fn as_observable(&self) -> Option<&dyn Observable> {
        None
    }
}

/// Wants to watch the bus once it exists.
pub trait Observable: Send + Sync {
    fn observe(&self, bus: &Bus);
}

/// Wants the capsule's governance handle.
pub trait Governable: Send + Sync {
    fn govern(&self, governance: Arc<dyn Governance>);
}
