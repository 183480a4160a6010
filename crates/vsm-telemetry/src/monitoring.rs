use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use vsm_core::{Bus, Message, Meta, Observable, SubscriptionId};

use crate::metrics::MetricsRecorder;

/// One observed bus message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub ts: DateTime<Utc>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    pub corr_id: Option<String>,
    pub meta: Meta,
}

impl From<&Message> for MonitorRecord {
    fn from(m: &Message) -> Self {
        Self {
            ts: Utc::now(),
            kind: m.kind.to_string(),
            path: m.path.clone(),
            corr_id: m.corr_id.clone(),
            meta: m.meta.clone(),
        }
    }
}

/// Destination for monitor records.
pub trait MonitorSink: Send + Sync {
    fn record(&self, record: &MonitorRecord);
}

/// Emits each record as a structured `tracing` event.
pub struct TracingSink;

impl MonitorSink for TracingSink {
    fn record(&self, record: &MonitorRecord) {
        tracing::info!(
            target: "vsm::monitor",
            kind = %record.kind,
            corr_id = record.corr_id.as_deref().unwrap_or(""),
            session_id = record.meta.session_id.as_ref().map(|s| s.as_str()).unwrap_or(""),
            path = %record.path.join("/"),
            "bus message"
        );
    }
}

/// Writes one JSON object per line.
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl JsonlSink<File> {
    /// Append to the file at `path`, creating it if needed.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> MonitorSink for JsonlSink<W> {
    fn record(&self, record: &MonitorRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "monitor sink write failed");
        }
    }
}

/// Read-only bus observer forwarding every message to a sink.
pub struct Monitoring {
    sink: Arc<dyn MonitorSink>,
    metrics: Option<Arc<MetricsRecorder>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl Monitoring {
    pub fn new(sink: Arc<dyn MonitorSink>) -> Self {
        Self {
            sink,
            metrics: None,
            subscription: Mutex::new(None),
        }
    }

    /// Also count messages per kind in `bus_messages_total`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        *self.subscription.lock()
    }
}

impl Observable for Monitoring {
    fn observe(&self, bus: &Bus) {
        let sink = Arc::clone(&self.sink);
        let metrics = self.metrics.clone();
        let id = bus.subscribe(move |message| {
            if let Some(metrics) = &metrics {
                metrics.counter_inc("bus_messages_total", &[("kind", message.kind.as_str())], 1);
            }
            sink.record(&MonitorRecord::from(&message));
        });
        if let Some(previous) = self.subscription.lock().replace(id) {
            bus.unsubscribe(previous);
        }
    }
}
