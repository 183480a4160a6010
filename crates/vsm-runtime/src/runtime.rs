//! Process wiring: the dispatch loop plus every port, as tokio tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vsm_core::SubscriptionId;

use crate::capsule::Capsule;
use crate::error::RuntimeError;
use crate::port::{egress_subscribe, Port};

pub struct Runtime;

impl Runtime {
    /// Spawn the capsule loop, subscribe every port for egress and spawn
    /// every port's ingress loop.
    pub fn start(capsule: Arc<Capsule>, ports: Vec<Arc<dyn Port>>) -> RuntimeHandle {
        let token = CancellationToken::new();

        let loop_token = token.clone();
        let loop_capsule = Arc::clone(&capsule);
        let dispatch = tokio::spawn(async move {
            tokio::select! {
                _ = loop_token.cancelled() => {}
                _ = loop_capsule.run() => {}
            }
        });

        let mut subscriptions = Vec::with_capacity(ports.len());
        let mut port_tasks = Vec::with_capacity(ports.len());
        for port in ports {
            subscriptions.push(egress_subscribe(Arc::clone(&port), capsule.bus()));
            let name = port.name().to_string();
            let port_capsule = Arc::clone(&capsule);
            let port_token = token.clone();
            let task = tokio::spawn(async move {
                tokio::select! {
                    _ = port_token.cancelled() => Ok(()),
                    result = port.run(port_capsule) => result,
                }
            });
            port_tasks.push((name, task));
        }

        info!(capsule = %capsule.name(), ports = port_tasks.len(), "runtime started");
        RuntimeHandle {
            capsule,
            token,
            dispatch,
            ports: port_tasks,
            subscriptions,
        }
    }
}

pub struct RuntimeHandle {
    capsule: Arc<Capsule>,
    token: CancellationToken,
    dispatch: JoinHandle<()>,
    ports: Vec<(String, JoinHandle<Result<(), RuntimeError>>)>,
    subscriptions: Vec<SubscriptionId>,
}

impl RuntimeHandle {
    pub fn capsule(&self) -> &Arc<Capsule> {
        &self.capsule
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop every task and detach the ports. In-flight provider calls and
    /// tool runs are abandoned.
    pub fn shutdown(&self) {
        self.token.cancel();
        self.dispatch.abort();
        for (_, task) in &self.ports {
            task.abort();
        }
        self.detach_ports();
        info!(capsule = %self.capsule.name(), "runtime shut down");
    }

    /// Wait for every port loop, then stop the dispatch loop. Returns the
    /// first port error.
    pub async fn join(mut self) -> Result<(), RuntimeError> {
        let mut first_error = None;
        for (name, task) in std::mem::take(&mut self.ports) {
            let outcome = match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Ok(()),
                Err(e) => Err(RuntimeError::from(e)),
            };
            if let Err(e) = outcome {
                warn!(port = %name, error = %e, "port loop failed");
                first_error.get_or_insert(e);
            }
        }
        self.token.cancel();
        self.detach_ports();
        if let Err(e) = self.dispatch.await {
            if !e.is_cancelled() {
                first_error.get_or_insert(RuntimeError::from(e));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn detach_ports(&self) {
        for id in &self.subscriptions {
            self.capsule.bus().unsubscribe(*id);
        }
    }
}
