//! Result aggregation.
//!
//! A pure fold of the collected per-item outcomes into a [`BatchResult`].
//! Duplicate completions from redundant lanes are collapsed before this
//! point (first result wins), so aggregation is idempotent given the same
//! outcome map.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchState;
use crate::dispatch::ItemOutcome;
use crate::manifest::JobManifest;

/// Per-node share of the work actually performed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUtilization {
    pub items_processed: usize,
    /// Fraction of all resolved items handled by this node, 0-100.
    pub share_pct: f64,
}

/// Write-once summary of a batch that reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub state: BatchState,
    pub total_items: usize,
    pub succeeded: usize,
    /// Every item without a successful outcome, including items the deadline
    /// cut off. `succeeded + failed_items.len() == total_items` always holds.
    pub failed_items: Vec<String>,
    pub per_node: HashMap<String, NodeUtilization>,
    pub avg_item_latency_ms: f64,
    pub throughput_per_sec: f64,
    /// Opaque verification references handed back by nodes.
    pub attestations: Vec<String>,
    pub wall_clock_ms: u64,
}

impl BatchResult {
    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total_items as f64
    }
}

/// Fold collected outcomes into a [`BatchResult`].
pub fn aggregate(
    batch_id: Uuid,
    state: BatchState,
    manifests: &[JobManifest],
    outcomes: &HashMap<String, ItemOutcome>,
    wall_clock: Duration,
) -> BatchResult {
    let total_items = manifests.len();
    let mut succeeded = 0usize;
    let mut failed_items = Vec::new();
    let mut attestations = Vec::new();
    let mut per_node_counts: HashMap<String, usize> = HashMap::new();
    let mut latency_sum_ms = 0u64;
    let mut resolved = 0usize;

    for manifest in manifests {
        match outcomes.get(&manifest.item_id) {
            Some(outcome) => {
                resolved += 1;
                latency_sum_ms += outcome.duration_ms;
                if !outcome.node_id.is_empty() {
                    *per_node_counts.entry(outcome.node_id.clone()).or_default() += 1;
                }
                if outcome.success {
                    succeeded += 1;
                    if let Some(ref attestation) = outcome.attestation {
                        attestations.push(attestation.clone());
                    }
                } else {
                    failed_items.push(manifest.item_id.clone());
                }
            }
            // Deadline expired before the item reported.
            None => failed_items.push(manifest.item_id.clone()),
        }
    }

    let per_node = per_node_counts
        .into_iter()
        .map(|(node_id, count)| {
            let share_pct = if resolved == 0 {
                0.0
            } else {
                100.0 * count as f64 / resolved as f64
            };
            (
                node_id,
                NodeUtilization {
                    items_processed: count,
                    share_pct,
                },
            )
        })
        .collect();

    let wall_secs = wall_clock.as_secs_f64();
    BatchResult {
        batch_id,
        state,
        total_items,
        succeeded,
        failed_items,
        per_node,
        avg_item_latency_ms: if resolved == 0 {
            0.0
        } else {
            latency_sum_ms as f64 / resolved as f64
        },
        throughput_per_sec: if wall_secs > 0.0 {
            resolved as f64 / wall_secs
        } else {
            0.0
        },
        attestations,
        wall_clock_ms: wall_clock.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::WorkItem;
    use chrono::Utc;

    fn outcome(item: &str, node: &str, success: bool, ms: u64) -> ItemOutcome {
        ItemOutcome {
            item_id: item.to_string(),
            node_id: node.to_string(),
            success,
            output: None,
            error: (!success).then(|| "boom".to_string()),
            attestation: success.then(|| format!("att-{item}")),
            duration_ms: ms,
            completed_at: Utc::now(),
        }
    }

    fn manifests(ids: &[&str]) -> Vec<JobManifest> {
        ids.iter()
            .map(|id| JobManifest::wrap(&WorkItem::new(*id, format!("cas://{id}"))))
            .collect()
    }

    #[test]
    fn counts_balance() {
        let manifests = manifests(&["a", "b", "c"]);
        let mut outcomes = HashMap::new();
        outcomes.insert("a".to_string(), outcome("a", "n1", true, 40));
        outcomes.insert("b".to_string(), outcome("b", "n2", false, 60));
        // "c" never reported

        let result = aggregate(
            Uuid::new_v4(),
            BatchState::TimedOut,
            &manifests,
            &outcomes,
            Duration::from_secs(2),
        );
        assert_eq!(result.succeeded, 1);
        assert_eq!(result.failed_items.len(), 2);
        assert_eq!(result.succeeded + result.failed_items.len(), result.total_items);
        assert_eq!(result.attestations, vec!["att-a".to_string()]);
    }

    #[test]
    fn aggregation_is_idempotent() {
        let manifests = manifests(&["a", "b"]);
        let mut outcomes = HashMap::new();
        outcomes.insert("a".to_string(), outcome("a", "n1", true, 10));
        outcomes.insert("b".to_string(), outcome("b", "n1", true, 30));

        let id = Uuid::new_v4();
        let first = aggregate(id, BatchState::Completed, &manifests, &outcomes, Duration::from_secs(1));
        let second = aggregate(id, BatchState::Completed, &manifests, &outcomes, Duration::from_secs(1));
        assert_eq!(first.succeeded, second.succeeded);
        assert_eq!(first.failed_items, second.failed_items);
        assert!((first.avg_item_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(first.per_node["n1"].items_processed, 2);
        assert!((first.per_node["n1"].share_pct - 100.0).abs() < 1e-9);
    }
}
