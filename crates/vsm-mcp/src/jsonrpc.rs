//! JSON-RPC 2.0 envelopes.
//!
//! Ids are kept as raw JSON values and compared by their textual form, so a
//! peer answering `"7"` to request `7` still matches.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A request, or a notification when `id` is absent.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "jsonrpc": "2.0",
            "method": self.method,
            "params": self.params,
        });
        if let Some(id) = &self.id {
            out["id"] = id.clone();
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: Value,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn to_value(&self) -> Value {
        match &self.outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": self.id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": self.id, "error": error}),
        }
    }
}

/// What arrived on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Request(Request),
    Response(Response),
    /// Carries an id but neither `result` nor `error`.
    Malformed { id: Value },
}

impl Incoming {
    /// Classify a decoded frame. `None` when it is neither shape.
    pub fn classify(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        if let Some(Value::String(method)) = obj.remove("method") {
            let id = obj.remove("id").filter(|id| !id.is_null());
            let params = obj.remove("params").unwrap_or(Value::Null);
            return Some(Self::Request(Request { id, method, params }));
        }
        let id = obj.remove("id")?;
        if let Some(error) = obj.remove("error") {
            let error = serde_json::from_value(error.clone())
                .unwrap_or_else(|_| RpcError::new(INTERNAL_ERROR, error.to_string()));
            return Some(Self::Response(Response::err(id, error)));
        }
        match obj.remove("result") {
            Some(result) => Some(Self::Response(Response::ok(id, result))),
            None if id.is_null() => None,
            None => Some(Self::Malformed { id }),
        }
    }
}

/// Correlation key of a request id.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
