pub mod bus;
pub mod errors;
pub mod ids;
pub mod message;
pub mod provider;
pub mod registry;
pub mod roles;
pub mod tools;

pub use bus::{Bus, BusContext};
pub use errors::ProviderError;
pub use ids::{CallId, SessionId, SubscriptionId};
pub use message::{Message, MessageKind, Meta, ToolCallPayload, ALGEDONIC};
pub use provider::{
    ConversationTurn, EventSink, InvokePolicy, ProviderAdapter, ProviderEvent, ProviderFamily,
    ToolCallRequest,
};
pub use registry::{ToolRegistry, ToolSource};
pub use roles::{Continuation, Governable, Governance, Handler, Identity, Observable};
pub use tools::{ExecutionPolicy, Tool, ToolDescriptor, ToolError};
