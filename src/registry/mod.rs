//! Node registry: the single owner of [`ComputeNode`] records.
//!
//! The registry map is the only structure in the engine written from more
//! than one concurrent path (health monitor writes, allocator and service
//! read). It is shared as `Arc<RwLock<NodeRegistry>>`; readers take cloned
//! snapshots, so stale load figures are possible and acceptable.

pub mod node;

use std::collections::HashMap;

use crate::error::{GridError, Result};

pub use node::{ComputeNode, NodeCapability, NodeStatus, ResourceClass};

/// Filter for [`NodeRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub region: Option<String>,
}

impl NodeFilter {
    pub fn active() -> Self {
        Self {
            status: Some(NodeStatus::Active),
            region: None,
        }
    }

    fn matches(&self, node: &ComputeNode) -> bool {
        if let Some(status) = self.status {
            if node.status != status {
                return false;
            }
        }
        if let Some(ref region) = self.region {
            if &node.region != region {
                return false;
            }
        }
        true
    }
}

/// Registry of known compute nodes.
///
/// Nodes are never removed; churn is expressed through status so historical
/// performance figures survive outages.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, ComputeNode>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly discovered node.
    pub fn register(&mut self, node: ComputeNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(GridError::DuplicateNode(node.id));
        }
        tracing::info!(
            node_id = %node.id,
            region = %node.region,
            parallel_units = node.capability.parallel_units,
            "Node registered"
        );
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<&ComputeNode> {
        self.nodes.get(node_id)
    }

    /// Nodes matching the filter, cloned out of the map.
    pub fn list(&self, filter: &NodeFilter) -> Vec<ComputeNode> {
        self.nodes
            .values()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect()
    }

    /// Copy-on-read snapshot of every known node.
    pub fn snapshot(&self) -> Vec<ComputeNode> {
        self.nodes.values().cloned().collect()
    }

    /// Nodes currently eligible for new work.
    pub fn allocatable(&self) -> Vec<ComputeNode> {
        self.nodes
            .values()
            .filter(|n| n.status.is_allocatable())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mutate one node record in place. Health-monitor use only.
    pub(crate) fn update<F>(&mut self, node_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut ComputeNode),
    {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                f(node);
                Ok(())
            }
            None => Err(GridError::NodeNotFound(node_id.to_string())),
        }
    }

    /// Fold an observed per-item duration and success flag into a node's
    /// rolling averages. Called by the batch manager when outcomes arrive.
    pub(crate) fn record_outcome(&mut self, node_id: &str, duration_ms: u64, success: bool, alpha: f64) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            let observed = duration_ms as f64;
            node.avg_job_duration_ms = if node.avg_job_duration_ms == 0.0 {
                observed
            } else {
                alpha * observed + (1.0 - alpha) * node.avg_job_duration_ms
            };
            let hit = if success { 1.0 } else { 0.0 };
            node.success_rate = alpha * hit + (1.0 - alpha) * node.success_rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, region: &str) -> ComputeNode {
        ComputeNode::new(id, region, NodeCapability::new("cpu", 4))
    }

    #[test]
    fn register_and_get() {
        let mut reg = NodeRegistry::new();
        reg.register(node("n1", "us-east")).unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("n1").unwrap().region, "us-east");
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = NodeRegistry::new();
        reg.register(node("n1", "us-east")).unwrap();
        assert!(matches!(
            reg.register(node("n1", "eu-west")),
            Err(GridError::DuplicateNode(_))
        ));
    }

    #[test]
    fn list_filters_by_status_and_region() {
        let mut reg = NodeRegistry::new();
        reg.register(node("n1", "us-east")).unwrap();
        reg.register(node("n2", "eu-west")).unwrap();
        reg.update("n2", |n| n.status = NodeStatus::Offline).unwrap();

        assert_eq!(reg.list(&NodeFilter::active()).len(), 1);
        let eu = NodeFilter {
            status: None,
            region: Some("eu-west".to_string()),
        };
        assert_eq!(reg.list(&eu).len(), 1);
        assert_eq!(reg.list(&eu)[0].id, "n2");
    }

    #[test]
    fn record_outcome_seeds_then_smooths() {
        let mut reg = NodeRegistry::new();
        reg.register(node("n1", "us-east")).unwrap();

        reg.record_outcome("n1", 100, true, 0.3);
        assert!((reg.get("n1").unwrap().avg_job_duration_ms - 100.0).abs() < 1e-9);

        reg.record_outcome("n1", 200, true, 0.3);
        let avg = reg.get("n1").unwrap().avg_job_duration_ms;
        assert!((avg - 130.0).abs() < 1e-9);
    }
}
