use std::sync::Arc;

use tracing::{debug, info};
use vsm_core::{Bus, Governance, Handler, Identity, Observable, Tool, ToolSource};
use vsm_settings::{HomeostatLimits, VsmSettings};
use vsm_telemetry::MetricsRecorder;

use crate::capsule::Capsule;
use crate::coordinator::Coordinator;
use crate::dispatcher::{ToolDispatcher, DEFAULT_ISOLATED_WORKERS};
use crate::homeostat::Homeostat;
use crate::roles::{DefaultIdentity, PassThroughGovernance};

/// Assembles a [`Capsule`] from its roles and tool children.
///
/// Defaults: [`DefaultIdentity`], [`PassThroughGovernance`], no
/// intelligence (a tool-only capsule) and no monitoring.
pub struct CapsuleBuilder {
    name: String,
    identity: Arc<dyn Identity>,
    governance: Arc<dyn Governance>,
    intelligence: Option<Arc<dyn Handler>>,
    monitoring: Option<Arc<dyn Observable>>,
    tools: Vec<(Arc<dyn Tool>, ToolSource)>,
    isolated_workers: usize,
    subscriber_capacity: usize,
    limits: HomeostatLimits,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl CapsuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            identity: Arc::new(DefaultIdentity::new(name.clone())),
            name,
            governance: Arc::new(PassThroughGovernance),
            intelligence: None,
            monitoring: None,
            tools: Vec::new(),
            isolated_workers: DEFAULT_ISOLATED_WORKERS,
            subscriber_capacity: vsm_core::bus::DEFAULT_SUBSCRIBER_CAPACITY,
            limits: HomeostatLimits::default(),
            metrics: None,
        }
    }

    /// Take worker count, queue bound and limits from settings.
    pub fn with_settings(mut self, settings: &VsmSettings) -> Self {
        self.isolated_workers = settings.runtime.isolated_workers;
        self.subscriber_capacity = settings.runtime.subscriber_capacity;
        self.limits = settings.homeostat.clone();
        self
    }

    pub fn identity(mut self, identity: Arc<dyn Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn governance(mut self, governance: Arc<dyn Governance>) -> Self {
        self.governance = governance;
        self
    }

    pub fn intelligence(mut self, intelligence: Arc<dyn Handler>) -> Self {
        self.intelligence = Some(intelligence);
        self
    }

    pub fn monitoring(mut self, monitoring: Arc<dyn Observable>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tool(self, tool: Arc<dyn Tool>) -> Self {
        self.tool_with_source(tool, ToolSource::BuiltIn)
    }

    pub fn tool_with_source(mut self, tool: Arc<dyn Tool>, source: ToolSource) -> Self {
        self.tools.push((tool, source));
        self
    }

    pub fn isolated_workers(mut self, workers: usize) -> Self {
        self.isolated_workers = workers;
        self
    }

    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn homeostat(mut self, limits: HomeostatLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Wire everything to a fresh bus. Observers subscribe here, so this
    /// must run inside a tokio runtime when any are present.
    pub fn build(self) -> Arc<Capsule> {
        let bus = Bus::with_capacity(self.subscriber_capacity);
        {
            let registry = bus.context().operations_children();
            let mut registry = registry.lock();
            for (tool, source) in &self.tools {
                registry.register(Arc::clone(tool), source.clone());
            }
        }

        for (tool, _) in &self.tools {
            if let Some(governable) = tool.as_governable() {
                governable.govern(Arc::clone(&self.governance));
            }
            if let Some(observable) = tool.as_observable() {
                observable.observe(&bus);
            }
        }
        if let Some(observable) = self.intelligence.as_ref().and_then(|i| i.as_observable()) {
            observable.observe(&bus);
        }
        if let Some(monitoring) = &self.monitoring {
            monitoring.observe(&bus);
        }

        let homeostat = Arc::new(Homeostat::new(self.limits));
        let mut operations = ToolDispatcher::new(Arc::clone(&homeostat), self.isolated_workers);
        if let Some(metrics) = self.metrics {
            operations = operations.with_metrics(metrics);
        }

        info!(
            capsule = %self.name,
            tools = self.tools.len(),
            intelligence = self.intelligence.is_some(),
            "capsule built"
        );
        debug!(workers = self.isolated_workers, "isolated worker pool sized");

        Arc::new(Capsule {
            name: self.name,
            bus,
            coordinator: Coordinator::new(),
            homeostat,
            identity: self.identity,
            governance: self.governance,
            operations,
            intelligence: self.intelligence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vsm_core::{Governable, ToolDescriptor, ToolError};

    #[derive(Default)]
    struct Wired {
        governed: Mutex<Option<Arc<dyn Governance>>>,
        observed: AtomicUsize,
    }

    impl Governable for Wired {
        fn govern(&self, governance: Arc<dyn Governance>) {
            *self.governed.lock() = Some(governance);
        }
    }

    impl Observable for Wired {
        fn observe(&self, _bus: &Bus) {
            self.observed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Tool for Wired {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("wired", "capability test", json!({}))
        }
        async fn run(&self, _args: Value) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
        fn as_observable(&self) -> Option<&dyn Observable> {
            Some(self)
        }
        fn as_governable(&self) -> Option<&dyn Governable> {
            Some(self)
        }
    }

    struct Plain;

    #[async_trait]
    impl Tool for Plain {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("plain", "no capabilities", json!({}))
        }
        async fn run(&self, _args: Value) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn defaults_build_a_tool_only_capsule() {
        let capsule = CapsuleBuilder::new("bare").tool(Arc::new(Plain)).build();
        assert_eq!(capsule.name(), "bare");
        assert_eq!(capsule.tool_names(), vec!["plain"]);
        assert!(capsule.intelligence.is_none());
        assert_eq!(capsule.homeostat().limits().tokens, 8_000);
    }

    #[test]
    fn capabilities_are_wired_once() {
        let wired = Arc::new(Wired::default());
        let _capsule = CapsuleBuilder::new("caps")
            .tool(Arc::clone(&wired) as Arc<dyn Tool>)
            .tool(Arc::new(Plain))
            .build();
        assert!(wired.governed.lock().is_some());
        assert_eq!(wired.observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sources_are_recorded() {
        let capsule = CapsuleBuilder::new("src")
            .tool_with_source(Arc::new(Plain), ToolSource::Mcp("remote".into()))
            .build();
        let registry = capsule.bus().context().operations_children();
        assert_eq!(registry.lock().source("plain"), Some(&ToolSource::Mcp("remote".into())));
    }

    #[test]
    fn settings_size_the_runtime() {
        let mut settings = VsmSettings::default();
        settings.homeostat.bytes = 10;
        let capsule = CapsuleBuilder::new("cfg").with_settings(&settings).build();
        assert_eq!(capsule.homeostat().limits().bytes, 10);
    }
}
