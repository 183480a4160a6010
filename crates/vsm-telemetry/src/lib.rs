mod metrics;
mod monitoring;

pub use metrics::{HistogramSummary, MetricType, MetricsRecorder, MetricsSnapshot, HISTOGRAM_WINDOW};
pub use monitoring::{JsonlSink, MonitorRecord, MonitorSink, Monitoring, TracingSink};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "vsm_mcp" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from textual levels; unparseable levels are skipped.
    pub fn from_levels<'a>(
        level: &str,
        module_levels: impl IntoIterator<Item = (&'a str, &'a str)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: module_levels
                .into_iter()
                .filter_map(|(m, l)| l.parse().ok().map(|l| (m.to_string(), l)))
                .collect(),
            json,
        }
    }

    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle kept alive for the process lifetime.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }
}

/// Initialize tracing. Call once at startup; logs go to stderr so stdout
/// stays free for the stdio RPC transport.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
    });

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
    if let Err(e) = result {
        eprintln!("vsm-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
        level_filter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig::from_levels("warn", [("vsm_mcp", "debug"), ("x", "bogus")], false);
        assert_eq!(config.filter_directives(), "warn,vsm_mcp=debug");
    }

    #[test]
    fn bad_default_level_falls_back_to_info() {
        let config = TelemetryConfig::from_levels("loud", [], true);
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.json);
    }
}
