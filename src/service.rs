//! Top-level service facade wiring every subsystem together.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::BatchResult;
use crate::allocator::NodeAllocator;
use crate::batch::{BatchJobManager, BatchOptions, BatchStatus};
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::manifest::WorkItem;
use crate::registry::{ComputeNode, NodeRegistry, NodeStatus};
use crate::stream::{ResultCallback, StreamPipeline, StreamSummary};

/// Aggregate service-level metrics for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub active_nodes: usize,
    /// Sum of parallel units across allocatable nodes.
    pub total_capacity: u32,
    /// Mean load percentage across allocatable nodes.
    pub average_load: f64,
    pub active_batches: usize,
}

/// The scheduling engine: node registry, health monitoring, allocation,
/// batch lifecycle, and streaming, behind one facade.
pub struct GridService {
    config: SchedulerConfig,
    registry: Arc<RwLock<NodeRegistry>>,
    dispatcher: Arc<dyn Dispatcher>,
    batch_manager: Arc<BatchJobManager>,
    stream_pipeline: StreamPipeline,
}

impl GridService {
    pub fn new(config: SchedulerConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let registry = Arc::new(RwLock::new(NodeRegistry::new()));
        let allocator = Arc::new(NodeAllocator::new(registry.clone()));
        let batch_manager = Arc::new(BatchJobManager::new(
            registry.clone(),
            allocator.clone(),
            dispatcher.clone(),
            config.clone(),
        ));
        let stream_pipeline = StreamPipeline::new(
            allocator.clone(),
            dispatcher.clone(),
            config.stream.clone(),
        );

        Self {
            config,
            registry,
            dispatcher,
            batch_manager,
            stream_pipeline,
        }
    }

    /// Start background subsystems (currently the health monitor). Returns
    /// immediately; loops stop when the token is cancelled.
    pub fn run(&self, cancel: CancellationToken) {
        let monitor = HealthMonitor::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            self.config.health.clone(),
        );
        tokio::spawn(async move {
            monitor.run(cancel).await;
        });
    }

    /// Register a discovered compute node.
    pub async fn register_node(&self, node: ComputeNode) -> Result<()> {
        self.registry.write().await.register(node)
    }

    /// Submit an item collection as a batch job.
    pub async fn submit(
        &self,
        items: Vec<WorkItem>,
        job_type: impl Into<String>,
        options: BatchOptions,
    ) -> Result<Uuid> {
        self.batch_manager.submit(items, job_type, options).await
    }

    /// State and advisory progress for a batch.
    pub async fn status(&self, batch_id: Uuid) -> Result<BatchStatus> {
        self.batch_manager.status(batch_id).await
    }

    /// Block until the batch is terminal or `timeout` elapses; always
    /// returns a [`BatchResult`] for a known batch.
    pub async fn await_completion(&self, batch_id: Uuid, timeout: Duration) -> Result<BatchResult> {
        self.batch_manager.await_completion(batch_id, timeout).await
    }

    /// Run the streaming pipeline over an input channel.
    pub async fn process_stream(
        &self,
        items: mpsc::Receiver<WorkItem>,
        on_result: ResultCallback,
    ) -> Result<StreamSummary> {
        self.stream_pipeline.process_stream(items, on_result).await
    }

    /// Read-only snapshot of every known node.
    pub async fn node_status(&self) -> Vec<ComputeNode> {
        self.registry.read().await.snapshot()
    }

    pub async fn metrics(&self) -> ServiceMetrics {
        let nodes = self.registry.read().await.snapshot();
        let active: Vec<&ComputeNode> = nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .collect();

        let total_capacity = active.iter().map(|n| n.capability.parallel_units).sum();
        let average_load = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|n| n.load_pct).sum::<f64>() / active.len() as f64
        };

        ServiceMetrics {
            active_nodes: active.len(),
            total_capacity,
            average_load,
            active_batches: self.batch_manager.active_batches().await,
        }
    }
}
