use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::time::Instant;

use crate::error::{GridError, Result};
use crate::manifest::JobManifest;

use super::{Dispatcher, ItemOutcome, JobHandle, PollState, ProbeReport};

/// In-process simulated node pool.
///
/// Accepts every manifest, completes it after a randomized latency, and fails
/// a configurable fraction of items. Good enough to drive the CLI and demos
/// without any real remote endpoint.
pub struct SimulatedDispatcher {
    fail_rate: f64,
    min_latency: Duration,
    max_latency: Duration,
    inflight: Mutex<HashMap<JobHandle, PendingJob>>,
    node_load: Mutex<HashMap<String, f64>>,
}

struct PendingJob {
    ready_at: Instant,
    outcome: ItemOutcome,
}

impl SimulatedDispatcher {
    pub fn new(fail_rate: f64) -> Self {
        Self::with_latency(fail_rate, Duration::from_millis(20), Duration::from_millis(120))
    }

    pub fn with_latency(fail_rate: f64, min_latency: Duration, max_latency: Duration) -> Self {
        Self {
            fail_rate: fail_rate.clamp(0.0, 1.0),
            min_latency,
            max_latency,
            inflight: Mutex::new(HashMap::new()),
            node_load: Mutex::new(HashMap::new()),
        }
    }

    /// Pin the load a probe will report for a node.
    pub fn set_node_load(&self, node_id: &str, load_pct: f64) {
        self.node_load
            .lock()
            .expect("node_load lock poisoned")
            .insert(node_id.to_string(), load_pct);
    }

    fn sample_latency(&self) -> Duration {
        let (lo, hi) = (self.min_latency.as_millis() as u64, self.max_latency.as_millis() as u64);
        if hi <= lo {
            return self.min_latency;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

#[async_trait]
impl Dispatcher for SimulatedDispatcher {
    async fn submit(&self, node_id: &str, manifest: &JobManifest) -> Result<JobHandle> {
        let handle = JobHandle::new(node_id, manifest.item_id.clone());
        let latency = self.sample_latency();
        let failed = rand::thread_rng().gen_bool(self.fail_rate);

        let outcome = ItemOutcome {
            item_id: manifest.item_id.clone(),
            node_id: node_id.to_string(),
            success: !failed,
            output: (!failed).then(|| {
                serde_json::json!({
                    "payload_ref": manifest.payload_ref,
                    "score": rand::thread_rng().gen_range(0.0..1.0),
                })
            }),
            error: failed.then(|| "simulated execution failure".to_string()),
            attestation: (!failed).then(|| format!("sim-attest-{:032x}", manifest.content_hash)),
            duration_ms: latency.as_millis() as u64,
            completed_at: Utc::now(),
        };

        self.inflight
            .lock()
            .map_err(|_| GridError::Internal("inflight lock poisoned".into()))?
            .insert(
                handle.clone(),
                PendingJob {
                    ready_at: Instant::now() + latency,
                    outcome,
                },
            );

        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollState> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| GridError::Internal("inflight lock poisoned".into()))?;

        match inflight.remove(handle) {
            None => Err(GridError::Internal(format!(
                "unknown job handle {}",
                handle.id
            ))),
            Some(job) if Instant::now() < job.ready_at => {
                inflight.insert(handle.clone(), job);
                Ok(PollState::Pending)
            }
            Some(job) => Ok(PollState::Done(job.outcome)),
        }
    }

    async fn probe(&self, node_id: &str) -> Result<ProbeReport> {
        let load = self
            .node_load
            .lock()
            .map_err(|_| GridError::Internal("node_load lock poisoned".into()))?
            .get(node_id)
            .copied()
            .unwrap_or_else(|| rand::thread_rng().gen_range(5.0..60.0));

        Ok(ProbeReport {
            node_id: node_id.to_string(),
            load_pct: load,
            queue_depth: (load / 10.0) as u32,
        })
    }
}
