use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, error};
use vsm_core::{Continuation, Governance, Identity, Message, MessageKind, ToolCallPayload};

/// Meta key set on tool calls that need a human confirmation.
pub const NEEDS_CONFIRM: &str = "needs_confirm";

/// Logs alarms. Handles nothing on the normal route.
#[derive(Clone, Debug)]
pub struct DefaultIdentity {
    identity: String,
    invariants: Vec<String>,
}

impl DefaultIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            invariants: Vec::new(),
        }
    }

    pub fn with_invariants(mut self, invariants: Vec<String>) -> Self {
        self.invariants = invariants;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn invariants(&self) -> &[String] {
        &self.invariants
    }
}

impl Identity for DefaultIdentity {
    fn alert(&self, message: &Message) {
        error!(
            identity = %self.identity,
            kind = %message.kind,
            path = ?message.path,
            meta = ?message.meta,
            "algedonic alert"
        );
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PassThroughGovernance;

impl Governance for PassThroughGovernance {
    fn enforce(&self, message: Message, next: Continuation<'_>) {
        next(message);
    }
}

/// Marks calls to the configured tools with `needs_confirm`, then continues.
#[derive(Clone, Debug, Default)]
pub struct ConfirmGovernance {
    tools: HashSet<String>,
}

impl ConfirmGovernance {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }
}

impl Governance for ConfirmGovernance {
    fn enforce(&self, mut message: Message, next: Continuation<'_>) {
        if message.kind == MessageKind::ToolCall {
            if let Some(call) = ToolCallPayload::from_message(&message) {
                if self.tools.contains(&call.tool) {
                    debug!(tool = %call.tool, "tool call flagged for confirmation");
                    let _ = message
                        .meta
                        .extra
                        .insert(NEEDS_CONFIRM.into(), Value::Bool(true));
                }
            }
        }
        next(message);
    }
}
