//! Batch job types and lifecycle state.

pub mod manager;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocator::{Allocation, Strategy};
use crate::manifest::JobManifest;
use crate::registry::ResourceClass;

pub use manager::BatchJobManager;

/// Lifecycle of a batch job.
///
/// `created → dispatched → monitoring → {completed | failed | timed_out}`.
/// Terminal states absorb; [`BatchJob::advance`] refuses to leave them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Created,
    Dispatched,
    Monitoring,
    Completed,
    Failed,
    TimedOut,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Failed | BatchState::TimedOut
        )
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchState::Created => write!(f, "created"),
            BatchState::Dispatched => write!(f, "dispatched"),
            BatchState::Monitoring => write!(f, "monitoring"),
            BatchState::Completed => write!(f, "completed"),
            BatchState::Failed => write!(f, "failed"),
            BatchState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Caller-supplied options for a batch submission.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Target node count; 0 derives it from the workload size.
    pub parallel_nodes: usize,
    /// Independent node subsets executing the same item set.
    pub redundancy: usize,
    /// Overrides the configured default deadline when set.
    pub deadline: Option<Duration>,
    pub strategy: Strategy,
    /// Requester region, consulted by `geo_proximity`.
    pub region: Option<String>,
    /// Only nodes advertising this accelerator tag may run the job.
    pub required_accelerator: Option<String>,
    /// Minimum per-node memory class.
    pub min_memory_class: ResourceClass,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel_nodes: 0,
            redundancy: 1,
            deadline: None,
            strategy: Strategy::WeightedCapacity,
            region: None,
            required_accelerator: None,
            min_memory_class: ResourceClass::Low,
        }
    }
}

/// One unit of distributable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub job_type: String,
    /// Immutable once the batch is dispatched.
    pub manifests: Vec<JobManifest>,
    pub state: BatchState,
    /// Node assignment; amended only under failover.
    pub allocation: Allocation,
    pub strategy: Strategy,
    pub redundancy: usize,
    /// Per-node execution requirements carried from the submission options.
    pub required_accelerator: Option<String>,
    pub min_memory_class: ResourceClass,
    pub created_at: DateTime<Utc>,
    pub deadline: Duration,
}

impl BatchJob {
    pub fn new(
        job_type: impl Into<String>,
        manifests: Vec<JobManifest>,
        options: &BatchOptions,
        deadline: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            manifests,
            state: BatchState::Created,
            allocation: Allocation::empty(),
            strategy: options.strategy,
            redundancy: options.redundancy.max(1),
            required_accelerator: options.required_accelerator.clone(),
            min_memory_class: options.min_memory_class,
            created_at: Utc::now(),
            deadline,
        }
    }

    /// Transition to `next` unless already terminal. Returns whether the
    /// transition was applied.
    pub fn advance(&mut self, next: BatchState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        tracing::debug!(batch_id = %self.id, from = %self.state, to = %next, "Batch state transition");
        self.state = next;
        true
    }

    pub fn total_items(&self) -> usize {
        self.manifests.len()
    }
}

/// Point-in-time view of a batch, returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: Uuid,
    pub state: BatchState,
    /// Advisory completion estimate, 0-100.
    pub progress_pct: f64,
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Advisory progress estimate: elapsed over estimated total duration,
/// clamped to [0, 95] until the batch is terminal. The last 5% is reserved
/// for finalization so progress never reports 100 before the result exists.
pub(crate) fn estimate_progress(
    elapsed: Duration,
    item_count: usize,
    avg_item_duration: Duration,
    node_count: usize,
) -> f64 {
    if item_count == 0 {
        return 0.0;
    }
    let per_node = node_count.max(1) as f64;
    let estimated_total =
        (item_count as f64 * avg_item_duration.as_secs_f64() / per_node).max(f64::EPSILON);
    let pct = 100.0 * elapsed.as_secs_f64() / estimated_total;
    pct.clamp(0.0, 95.0)
}
