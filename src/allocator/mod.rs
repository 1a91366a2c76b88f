//! Node allocation and load balancing.
//!
//! Given a workload size and a strategy, the allocator selects an ordered
//! subset of allocatable nodes from the registry, one subset per redundancy
//! lane. Strategies:
//! - **round_robin**: cycles through active nodes regardless of load
//! - **weighted_capacity**: ranks by `(1 - load/100) * parallel_units`
//! - **geo_proximity**: region matches first, weighted ranking within and
//!   beyond the region; falls back to plain weighted ranking when the region
//!   has no active node

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GridError, Result};
use crate::registry::{ComputeNode, NodeRegistry, ResourceClass};

/// Placement strategy, selected per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedCapacity,
    GeoProximity,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::WeightedCapacity => write!(f, "weighted_capacity"),
            Strategy::GeoProximity => write!(f, "geo_proximity"),
        }
    }
}

/// Inputs to one allocation decision.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub workload_size: usize,
    pub strategy: Strategy,
    /// Number of independent node subsets to produce. Minimum 1.
    pub redundancy: usize,
    /// Requester-declared region, consulted by `GeoProximity`.
    pub region: Option<String>,
    /// Explicit subset size; 0 derives it from the workload.
    pub parallel_nodes: usize,
    /// Only nodes advertising this accelerator tag are eligible.
    pub required_accelerator: Option<String>,
    /// Minimum memory class a node must advertise.
    pub min_memory_class: ResourceClass,
}

impl AllocationRequest {
    pub fn new(workload_size: usize, strategy: Strategy) -> Self {
        Self {
            workload_size,
            strategy,
            redundancy: 1,
            region: None,
            parallel_nodes: 0,
            required_accelerator: None,
            min_memory_class: ResourceClass::Low,
        }
    }
}

/// Result of an allocation: one ordered node-ID list per redundancy lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub subsets: Vec<Vec<String>>,
}

impl Allocation {
    pub fn empty() -> Self {
        Self {
            subsets: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subsets.iter().all(|s| s.is_empty())
    }

    /// The primary lane (first subset).
    pub fn primary(&self) -> &[String] {
        self.subsets.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct nodes across all lanes, in first-seen order.
    pub fn distinct_nodes(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for subset in &self.subsets {
            for id in subset {
                if !seen.contains(id) {
                    seen.push(id.clone());
                }
            }
        }
        seen
    }
}

/// Workload-size → subset-size capacity table.
pub fn target_node_count(workload_size: usize) -> usize {
    match workload_size {
        0 => 0,
        1..=100 => 2,
        101..=500 => 4,
        501..=1000 => 8,
        _ => 16,
    }
}

/// Selects node subsets for jobs according to a pluggable strategy.
pub struct NodeAllocator {
    registry: Arc<RwLock<NodeRegistry>>,
    cursor: AtomicUsize,
}

impl NodeAllocator {
    pub fn new(registry: Arc<RwLock<NodeRegistry>>) -> Self {
        Self {
            registry,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Allocate node subsets for a workload.
    ///
    /// A zero-size workload yields an empty allocation without error. A
    /// nonzero workload with no allocatable node is a synchronous
    /// [`GridError::NoCapacityAvailable`].
    pub async fn allocate(&self, request: &AllocationRequest) -> Result<Allocation> {
        if request.workload_size == 0 {
            return Ok(Allocation::empty());
        }

        let candidates: Vec<ComputeNode> = {
            let registry = self.registry.read().await;
            registry
                .allocatable()
                .into_iter()
                .filter(|n| {
                    request
                        .required_accelerator
                        .as_ref()
                        .map(|acc| &n.capability.accelerator == acc)
                        .unwrap_or(true)
                        && n.capability.memory_class >= request.min_memory_class
                })
                .collect()
        };

        if candidates.is_empty() {
            return Err(GridError::NoCapacityAvailable {
                strategy: request.strategy.to_string(),
                reason: "no active nodes satisfy the job requirements".to_string(),
            });
        }

        let ranked = match request.strategy {
            Strategy::RoundRobin => self.rank_round_robin(candidates),
            Strategy::WeightedCapacity => Self::rank_weighted(candidates),
            Strategy::GeoProximity => Self::rank_geo(candidates, request.region.as_deref()),
        };

        let subset_size = if request.parallel_nodes > 0 {
            request.parallel_nodes.min(ranked.len())
        } else {
            target_node_count(request.workload_size).min(ranked.len())
        };
        let lanes = request.redundancy.max(1);

        // Lanes prefer disjoint nodes; with few actives the ranked list wraps
        // and lanes overlap rather than failing the submission.
        let mut subsets = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let start = (lane * subset_size) % ranked.len();
            let subset: Vec<String> = (0..subset_size)
                .map(|i| ranked[(start + i) % ranked.len()].id.clone())
                .collect();
            subsets.push(subset);
        }

        tracing::debug!(
            strategy = %request.strategy,
            workload = request.workload_size,
            subset_size,
            lanes,
            "Allocation computed"
        );

        Ok(Allocation { subsets })
    }

    /// Cycle through active nodes in stable ID order, ignoring load.
    fn rank_round_robin(&self, mut candidates: Vec<ComputeNode>) -> Vec<ComputeNode> {
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.rotate_left(offset);
        candidates
    }

    /// Rank by available headroom × parallel capacity, descending.
    fn rank_weighted(mut candidates: Vec<ComputeNode>) -> Vec<ComputeNode> {
        candidates.sort_by(|a, b| {
            b.capacity_score()
                .partial_cmp(&a.capacity_score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Region matches first, weighted ranking within each group.
    fn rank_geo(candidates: Vec<ComputeNode>, region: Option<&str>) -> Vec<ComputeNode> {
        let Some(region) = region else {
            return Self::rank_weighted(candidates);
        };

        let (matched, other): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|n| n.region == region);

        if matched.is_empty() {
            tracing::debug!(region, "No active node in requested region, falling back to weighted ranking");
            return Self::rank_weighted(other);
        }

        let mut ranked = Self::rank_weighted(matched);
        ranked.extend(Self::rank_weighted(other));
        ranked
    }
}
