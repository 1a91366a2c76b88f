//! Remote dispatch capability.
//!
//! The scheduler never talks to a real execution protocol; everything it
//! needs from a remote node goes through the [`Dispatcher`] trait:
//! - **submit**: hand a manifest to a node, receive an opaque handle
//! - **poll**: check whether a handle has produced an outcome
//! - **probe**: liveness/load check used by the health monitor
//!
//! [`SimulatedDispatcher`] backs the CLI with an in-process pool; tests use
//! their own scripted implementation.

pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::manifest::JobManifest;

pub use sim::SimulatedDispatcher;

/// Opaque reference to work accepted by a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub node_id: String,
    pub item_id: String,
}

impl JobHandle {
    pub fn new(node_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.into(),
            item_id: item_id.into(),
        }
    }
}

/// Final outcome for one work item on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub node_id: String,
    pub success: bool,
    /// Opaque result payload handed back to the caller.
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Opaque verification/attestation reference, if the node produced one.
    pub attestation: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ItemOutcome {
    /// Synthetic failure recorded when no node ever accepted the item.
    pub fn rejected(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            node_id: String::new(),
            success: false,
            output: None,
            error: Some(reason.into()),
            attestation: None,
            duration_ms: 0,
            completed_at: Utc::now(),
        }
    }
}

/// Poll result for an in-flight handle.
#[derive(Debug, Clone)]
pub enum PollState {
    Pending,
    Done(ItemOutcome),
}

/// Snapshot returned by a successful liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub node_id: String,
    /// Instantaneous load percentage, 0-100.
    pub load_pct: f64,
    pub queue_depth: u32,
}

/// Abstract remote execution contract.
///
/// Submission is fire-and-forget from the scheduler's perspective: a
/// successful `submit` only means the node accepted the manifest, and there
/// is no way to cancel work already handed over.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, node_id: &str, manifest: &JobManifest) -> Result<JobHandle>;

    async fn poll(&self, handle: &JobHandle) -> Result<PollState>;

    async fn probe(&self, node_id: &str) -> Result<ProbeReport>;
}
