//! The capsule runtime: bus dispatch loop, turn coordination, the
//! per-session tool-calling state machine and tool execution.

pub mod builder;
pub mod capsule;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod homeostat;
pub mod orchestrator;
pub mod port;
pub mod roles;
pub mod runtime;

pub use builder::CapsuleBuilder;
pub use capsule::Capsule;
pub use coordinator::{order_key, Coordinator};
pub use dispatcher::{ToolDispatcher, DEFAULT_ISOLATED_WORKERS};
pub use error::RuntimeError;
pub use homeostat::{Homeostat, Metric};
pub use orchestrator::{SessionHooks, SessionOrchestrator, StaticPrompt};
pub use port::{egress_subscribe, Port};
pub use roles::{ConfirmGovernance, DefaultIdentity, PassThroughGovernance, NEEDS_CONFIRM};
pub use runtime::{Runtime, RuntimeHandle};
