use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use vsm_core::{Message, ALGEDONIC};
use vsm_settings::HomeostatLimits;

/// Resource tracked against a limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metric {
    Tokens,
    TimeMs,
    Bytes,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Tokens, Metric::TimeMs, Metric::Bytes];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::TimeMs => "time_ms",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage counters against fixed limits, plus the alarm predicate.
#[derive(Debug, Default)]
pub struct Homeostat {
    limits: HomeostatLimits,
    tokens: AtomicU64,
    time_ms: AtomicU64,
    bytes: AtomicU64,
}

impl Homeostat {
    pub fn new(limits: HomeostatLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> &HomeostatLimits {
        &self.limits
    }

    /// Messages carrying the algedonic severity bypass routing.
    pub fn alarm(&self, message: &Message) -> bool {
        message.meta.severity.as_deref() == Some(ALGEDONIC)
    }

    pub fn record(&self, metric: Metric, amount: u64) {
        let _ = self
            .counter(metric)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(amount))
            });
    }

    pub fn usage(&self, metric: Metric) -> u64 {
        self.counter(metric).load(Ordering::Relaxed)
    }

    pub fn limit(&self, metric: Metric) -> u64 {
        match metric {
            Metric::Tokens => self.limits.tokens,
            Metric::TimeMs => self.limits.time_ms,
            Metric::Bytes => self.limits.bytes,
        }
    }

    pub fn usage_snapshot(&self) -> BTreeMap<Metric, u64> {
        Metric::ALL.iter().map(|m| (*m, self.usage(*m))).collect()
    }

    /// Metrics whose usage is above their limit.
    pub fn exceeded(&self) -> Vec<Metric> {
        Metric::ALL
            .into_iter()
            .filter(|m| self.usage(*m) > self.limit(*m))
            .collect()
    }

    fn counter(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::Tokens => &self.tokens,
            Metric::TimeMs => &self.time_ms,
            Metric::Bytes => &self.bytes,
        }
    }
}
