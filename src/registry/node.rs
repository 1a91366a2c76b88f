use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness status of a compute node.
///
/// Transitions are performed only by the health monitor; everything else
/// reads these values as advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Busy,
    Maintenance,
    Offline,
}

impl NodeStatus {
    /// Whether the node may receive new work.
    pub fn is_allocatable(&self) -> bool {
        matches!(self, NodeStatus::Active)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Maintenance => write!(f, "maintenance"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Coarse three-level resource class used for memory and network bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceClass {
    Low,
    Standard,
    High,
}

impl Default for ResourceClass {
    fn default() -> Self {
        ResourceClass::Standard
    }
}

/// Advertised capability of a node, fixed at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapability {
    /// Accelerator/throughput class tag, e.g. "gpu-large" or "cpu".
    pub accelerator: String,
    pub parallel_units: u32,
    pub memory_class: ResourceClass,
    pub bandwidth_class: ResourceClass,
}

impl NodeCapability {
    pub fn new(accelerator: impl Into<String>, parallel_units: u32) -> Self {
        Self {
            accelerator: accelerator.into(),
            parallel_units,
            memory_class: ResourceClass::default(),
            bandwidth_class: ResourceClass::default(),
        }
    }
}

/// One remote execution endpoint and its best-effort live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeNode {
    pub id: String,
    pub region: String,
    pub capability: NodeCapability,

    pub status: NodeStatus,
    /// Load percentage, 0-100. Advisory; may be stale.
    pub load_pct: f64,
    /// Pending-queue length reported by the last probe. Advisory.
    pub queue_depth: u32,
    pub last_health_check: DateTime<Utc>,
    /// Rolling average job duration in milliseconds.
    pub avg_job_duration_ms: f64,
    /// Rolling success rate, 0.0-1.0.
    pub success_rate: f64,
    pub consecutive_probe_failures: u32,
}

impl ComputeNode {
    pub fn new(id: impl Into<String>, region: impl Into<String>, capability: NodeCapability) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            capability,
            status: NodeStatus::Active,
            load_pct: 0.0,
            queue_depth: 0,
            last_health_check: Utc::now(),
            avg_job_duration_ms: 0.0,
            success_rate: 1.0,
            consecutive_probe_failures: 0,
        }
    }

    /// Available-headroom score used by the weighted-capacity strategy.
    pub fn capacity_score(&self) -> f64 {
        (1.0 - self.load_pct / 100.0) * f64::from(self.capability.parallel_units)
    }
}
