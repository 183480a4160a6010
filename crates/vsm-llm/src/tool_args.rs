//! Per-index accumulation of streamed tool-call arguments.
//!
//! Vendors stream argument JSON as fragments that are only valid once the
//! call is closed. Fragments are buffered by the vendor's block index and
//! parsed exactly once, when that index closes.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::warn;
use vsm_core::{CallId, ToolCallRequest};

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    json: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    open: BTreeMap<u32, PartialCall>,
    closed: Vec<ToolCallRequest>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record identity for `index`. Later non-empty values overwrite.
    pub fn begin(&mut self, index: u32, id: Option<&str>, name: Option<&str>) {
        let call = self.open.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            call.id = Some(id.to_string());
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            call.name = Some(name.to_string());
        }
    }

    pub fn append(&mut self, index: u32, fragment: &str) {
        self.open.entry(index).or_default().json.push_str(fragment);
    }

    /// Parse and close `index`. Returns false if nothing was open there.
    pub fn close(&mut self, index: u32) -> bool {
        match self.open.remove(&index) {
            Some(call) => {
                self.closed.push(finalize(call));
                true
            }
            None => false,
        }
    }

    /// Close everything still open, in index order, and drain all calls.
    pub fn take(&mut self) -> Vec<ToolCallRequest> {
        let open = std::mem::take(&mut self.open);
        self.closed.extend(open.into_values().map(finalize));
        std::mem::take(&mut self.closed)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.closed.is_empty()
    }
}

fn finalize(call: PartialCall) -> ToolCallRequest {
    let id = call.id.unwrap_or_else(|| CallId::new().to_string());
    let name = call.name.unwrap_or_default();
    let arguments = parse_arguments(&call.json);
    ToolCallRequest {
        id,
        name,
        arguments,
    }
}

/// Empty text is `{}`. Text that fails to parse is kept as `{"_raw": text}`.
pub fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                error = %e,
                preview = %trimmed.chars().take(100).collect::<String>(),
                "tool call arguments did not parse"
            );
            json!({ "_raw": raw })
        }
    }
}
