//! Runs `tool_call` messages against the capsule's tools.
//!
//! Every call produces exactly one `tool_result` with the call's `corr_id`
//! and `meta`. Failures become `ERROR: <kind>: <message>` payloads.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use vsm_core::{
    Bus, ExecutionPolicy, Handler, Message, MessageKind, Tool, ToolCallPayload, ToolError,
};
use vsm_telemetry::MetricsRecorder;

use crate::homeostat::{Homeostat, Metric};

pub const DEFAULT_ISOLATED_WORKERS: usize = 4;

pub struct ToolDispatcher {
    workers: Arc<Semaphore>,
    homeostat: Arc<Homeostat>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ToolDispatcher {
    pub fn new(homeostat: Arc<Homeostat>, isolated_workers: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(isolated_workers.max(1))),
            homeostat,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn execute(&self, tool: Arc<dyn Tool>, call: ToolCallPayload, message: &Message, bus: &Bus) {
        let bus = bus.clone();
        let corr_id = message.corr_id.clone();
        let meta = message.meta.clone();
        let workers = Arc::clone(&self.workers);
        let homeostat = Arc::clone(&self.homeostat);
        let metrics = self.metrics.clone();
        let policy = tool.execution_policy();

        let _ = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match policy {
                ExecutionPolicy::Inline => run_inline(tool, call.args).await,
                ExecutionPolicy::Isolated => run_isolated(tool, call.args, &workers).await,
            };
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let (payload, status) = match outcome {
                Ok(value) => (value, "ok"),
                Err(e) => {
                    warn!(tool = %call.tool, kind = e.kind(), error = %e, "tool failed");
                    (Value::String(e.to_payload()), "error")
                }
            };
            homeostat.record(Metric::TimeMs, elapsed_ms);
            homeostat.record(Metric::Bytes, payload_bytes(&payload));
            if let Some(metrics) = &metrics {
                let labels = [("tool", call.tool.as_str()), ("status", status)];
                metrics.counter_inc("tool_calls_total", &labels, 1);
                metrics.histogram_observe("tool_duration_ms", &labels[..1], elapsed_ms as f64);
            }
            debug!(tool = %call.tool, elapsed_ms, status, "tool finished");
            bus.emit(Message::tool_result(payload, corr_id, meta));
        });
    }
}

impl Handler for ToolDispatcher {
    fn handle(&self, message: &Message, bus: &Bus) -> bool {
        if message.kind != MessageKind::ToolCall {
            return false;
        }
        let Some(call) = ToolCallPayload::from_message(message) else {
            let err = ToolError::InvalidArguments("tool_call payload needs a `tool` name".into());
            warn!(corr_id = ?message.corr_id, "malformed tool call");
            emit_error(bus, message, &err);
            return true;
        };
        let Some(tool) = bus.context().tool(&call.tool) else {
            let err = ToolError::UnknownTool(call.tool.clone());
            error!(tool = %call.tool, corr_id = ?message.corr_id, "unknown tool capsule");
            emit_error(bus, message, &err);
            return true;
        };
        self.execute(tool, call, message, bus);
        true
    }
}

fn emit_error(bus: &Bus, message: &Message, err: &ToolError) {
    bus.emit(Message::tool_result(
        Value::String(err.to_payload()),
        message.corr_id.clone(),
        message.meta.clone(),
    ));
}

/// Runs as a task on the shared scheduler.
async fn run_inline(tool: Arc<dyn Tool>, args: Value) -> Result<Value, ToolError> {
    AssertUnwindSafe(tool.run(args))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ToolError::Panicked(panic_message(panic.as_ref()))))
}

/// Runs on a blocking-pool thread, at most `workers` at a time.
async fn run_isolated(
    tool: Arc<dyn Tool>,
    args: Value,
    workers: &Arc<Semaphore>,
) -> Result<Value, ToolError> {
    let permit = Arc::clone(workers)
        .acquire_owned()
        .await
        .map_err(|_| ToolError::ExecutionFailed("isolated worker pool closed".into()))?;
    let handle = tokio::runtime::Handle::current();
    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        handle.block_on(tool.run(args))
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ToolError::Panicked(panic_message(e.into_panic().as_ref()))),
        Err(e) => Err(ToolError::ExecutionFailed(e.to_string())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".into()
    }
}

fn payload_bytes(payload: &Value) -> u64 {
    let len = match payload {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    u64::try_from(len).unwrap_or(u64::MAX)
}
