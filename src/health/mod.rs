//! Background health monitoring.
//!
//! The monitor sweeps the registry on a fixed interval and probes every
//! known node with a bounded timeout:
//! - probe failure demotes `Active`/`Busy` to `Maintenance`
//! - `offline_threshold` consecutive failures demote to `Offline`
//! - a single success while degraded restores `Active`
//! - successful probes refresh the load/queue estimates via an exponential
//!   moving average so one noisy reading cannot thrash placement decisions
//!
//! Probe errors are logged and absorbed here; they never reach callers.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::dispatch::{Dispatcher, ProbeReport};
use crate::registry::{NodeRegistry, NodeStatus};

pub struct HealthMonitor {
    registry: Arc<RwLock<NodeRegistry>>,
    dispatcher: Arc<dyn Dispatcher>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<RwLock<NodeRegistry>>,
        dispatcher: Arc<dyn Dispatcher>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
        }
    }

    /// Run probe sweeps until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Health monitor stopping");
                    break;
                }
            }
        }
    }

    /// One probe pass over every known node.
    pub async fn sweep(&self) {
        let node_ids: Vec<String> = {
            let registry = self.registry.read().await;
            registry.snapshot().into_iter().map(|n| n.id).collect()
        };

        for node_id in node_ids {
            let probe = tokio::time::timeout(
                self.config.probe_timeout,
                self.dispatcher.probe(&node_id),
            )
            .await;

            match probe {
                Ok(Ok(report)) => self.apply_success(&node_id, report).await,
                Ok(Err(e)) => {
                    tracing::warn!(node_id = %node_id, error = %e, "Probe failed");
                    self.apply_failure(&node_id).await;
                }
                Err(_) => {
                    tracing::warn!(
                        node_id = %node_id,
                        timeout_ms = self.config.probe_timeout.as_millis() as u64,
                        "Probe timed out"
                    );
                    self.apply_failure(&node_id).await;
                }
            }
        }
    }

    async fn apply_success(&self, node_id: &str, report: ProbeReport) {
        let alpha = self.config.ema_alpha;
        let busy_threshold = self.config.busy_load_threshold;

        let mut registry = self.registry.write().await;
        let result = registry.update(node_id, |node| {
            node.consecutive_probe_failures = 0;
            node.last_health_check = Utc::now();

            node.load_pct = if node.load_pct == 0.0 {
                report.load_pct
            } else {
                alpha * report.load_pct + (1.0 - alpha) * node.load_pct
            };
            node.queue_depth = (alpha * f64::from(report.queue_depth)
                + (1.0 - alpha) * f64::from(node.queue_depth))
            .round() as u32;

            let restored = matches!(node.status, NodeStatus::Maintenance | NodeStatus::Offline);
            node.status = if node.load_pct >= busy_threshold {
                NodeStatus::Busy
            } else {
                NodeStatus::Active
            };
            if restored {
                tracing::info!(node_id = %node.id, status = %node.status, "Node restored");
            }
        });

        if let Err(e) = result {
            tracing::warn!(node_id = %node_id, error = %e, "Probe result for unknown node");
        }
    }

    async fn apply_failure(&self, node_id: &str) {
        let threshold = self.config.offline_threshold;

        let mut registry = self.registry.write().await;
        let result = registry.update(node_id, |node| {
            node.consecutive_probe_failures += 1;
            node.last_health_check = Utc::now();

            if node.consecutive_probe_failures >= threshold {
                if node.status != NodeStatus::Offline {
                    tracing::warn!(
                        node_id = %node.id,
                        failures = node.consecutive_probe_failures,
                        "Node marked offline"
                    );
                }
                node.status = NodeStatus::Offline;
            } else if node.status != NodeStatus::Offline {
                node.status = NodeStatus::Maintenance;
            }
        });

        if let Err(e) = result {
            tracing::warn!(node_id = %node_id, error = %e, "Probe failure for unknown node");
        }
    }
}
