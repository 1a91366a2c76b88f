//! Batch job lifecycle: decomposition, dispatch, monitoring, aggregation.
//!
//! `submit` wraps items into manifests, obtains a node assignment from the
//! allocator, fans the manifests out across every redundancy lane, and
//! spawns a monitor task that polls for outcomes until the batch reaches a
//! terminal state or its deadline expires. One monitor task runs per active
//! batch; the shared batch map is only mutated by that task and by
//! `await_completion`'s timeout path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::aggregator::{aggregate, BatchResult};
use crate::allocator::{AllocationRequest, NodeAllocator};
use crate::batch::{estimate_progress, BatchJob, BatchOptions, BatchState, BatchStatus};
use crate::config::SchedulerConfig;
use crate::dispatch::{Dispatcher, ItemOutcome, JobHandle, PollState};
use crate::error::{GridError, Result};
use crate::manifest::{JobManifest, WorkItem};
use crate::registry::{NodeRegistry, NodeStatus};

/// An in-flight handle plus the manifest it covers, kept for failover.
#[derive(Debug, Clone)]
struct PendingDispatch {
    handle: JobHandle,
    manifest_idx: usize,
}

struct BatchEntry {
    job: BatchJob,
    /// First result per item wins; later lanes' duplicates are discarded.
    outcomes: HashMap<String, ItemOutcome>,
    pending: Vec<PendingDispatch>,
    state_tx: watch::Sender<BatchState>,
    result: Option<BatchResult>,
    started: Instant,
}

impl BatchEntry {
    fn finalize(&mut self, state: BatchState) {
        if !self.job.advance(state) {
            return;
        }
        let result = aggregate(
            self.job.id,
            state,
            &self.job.manifests,
            &self.outcomes,
            self.started.elapsed(),
        );
        tracing::info!(
            batch_id = %self.job.id,
            state = %state,
            succeeded = result.succeeded,
            failed = result.failed_items.len(),
            wall_clock_ms = result.wall_clock_ms,
            "Batch finished"
        );
        self.result = Some(result);
        let _ = self.state_tx.send(state);
    }
}

/// Owns every [`BatchJob`] and its derived [`BatchResult`].
pub struct BatchJobManager {
    registry: Arc<RwLock<NodeRegistry>>,
    allocator: Arc<NodeAllocator>,
    dispatcher: Arc<dyn Dispatcher>,
    config: SchedulerConfig,
    batches: Arc<RwLock<HashMap<Uuid, BatchEntry>>>,
}

impl BatchJobManager {
    pub fn new(
        registry: Arc<RwLock<NodeRegistry>>,
        allocator: Arc<NodeAllocator>,
        dispatcher: Arc<dyn Dispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            allocator,
            dispatcher,
            config,
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Decompose an item collection into a batch, dispatch it, and start
    /// monitoring. Allocation failure surfaces here, before anything is sent.
    pub async fn submit(
        &self,
        items: Vec<WorkItem>,
        job_type: impl Into<String>,
        options: BatchOptions,
    ) -> Result<Uuid> {
        let manifests: Vec<JobManifest> = items.iter().map(JobManifest::wrap).collect();
        let deadline = options
            .deadline
            .unwrap_or(self.config.batch.default_deadline);

        let allocation = self
            .allocator
            .allocate(&AllocationRequest {
                workload_size: manifests.len(),
                strategy: options.strategy,
                redundancy: options.redundancy.max(1),
                region: options.region.clone(),
                parallel_nodes: options.parallel_nodes,
                required_accelerator: options.required_accelerator.clone(),
                min_memory_class: options.min_memory_class,
            })
            .await?;

        let mut job = BatchJob::new(job_type, manifests, &options, deadline);
        job.allocation = allocation;
        let batch_id = job.id;

        tracing::info!(
            batch_id = %batch_id,
            job_type = %job.job_type,
            items = job.total_items(),
            strategy = %job.strategy,
            redundancy = job.redundancy,
            nodes = job.allocation.distinct_nodes().len(),
            "Batch submitted"
        );

        job.advance(BatchState::Dispatched);
        let pending = self.fan_out(&job).await;
        job.advance(BatchState::Monitoring);

        let (state_tx, _) = watch::channel(job.state);
        let entry = BatchEntry {
            job,
            outcomes: HashMap::new(),
            pending,
            state_tx,
            result: None,
            started: Instant::now(),
        };
        self.batches.write().await.insert(batch_id, entry);

        let batches = self.batches.clone();
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            Self::monitor(batches, registry, dispatcher, config, batch_id).await;
        });

        Ok(batch_id)
    }

    /// Send every manifest to its lane's nodes. Fire-and-forget: a rejected
    /// submit leaves the item without a handle on that lane, which the
    /// monitor later folds into the failure count.
    async fn fan_out(&self, job: &BatchJob) -> Vec<PendingDispatch> {
        let mut pending = Vec::with_capacity(job.total_items() * job.allocation.subsets.len());

        for subset in &job.allocation.subsets {
            if subset.is_empty() {
                continue;
            }
            for (idx, manifest) in job.manifests.iter().enumerate() {
                let node_id = &subset[idx % subset.len()];
                match self.dispatcher.submit(node_id, manifest).await {
                    Ok(handle) => pending.push(PendingDispatch {
                        handle,
                        manifest_idx: idx,
                    }),
                    Err(e) => {
                        tracing::warn!(
                            batch_id = %job.id,
                            node_id = %node_id,
                            item_id = %manifest.item_id,
                            error = %e,
                            "Dispatch rejected"
                        );
                    }
                }
            }
        }

        pending
    }

    /// Per-batch monitor loop: poll pending handles, fail over work stuck on
    /// offline nodes, and finalize on completion or deadline expiry.
    async fn monitor(
        batches: Arc<RwLock<HashMap<Uuid, BatchEntry>>>,
        registry: Arc<RwLock<NodeRegistry>>,
        dispatcher: Arc<dyn Dispatcher>,
        config: SchedulerConfig,
        batch_id: Uuid,
    ) {
        let mut interval = tokio::time::interval(config.batch.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            // Snapshot what we need without holding the lock across polls.
            let (pending, deadline, elapsed, manifests) = {
                let map = batches.read().await;
                let Some(entry) = map.get(&batch_id) else {
                    return;
                };
                if entry.job.state.is_terminal() {
                    return;
                }
                (
                    entry.pending.clone(),
                    entry.job.deadline,
                    entry.started.elapsed(),
                    entry.job.manifests.clone(),
                )
            };

            let mut resolved: Vec<ItemOutcome> = Vec::new();
            let mut still_pending: Vec<PendingDispatch> = Vec::new();
            for dispatch in pending {
                match dispatcher.poll(&dispatch.handle).await {
                    Ok(PollState::Done(outcome)) => resolved.push(outcome),
                    Ok(PollState::Pending) => still_pending.push(dispatch),
                    Err(e) => {
                        tracing::warn!(
                            batch_id = %batch_id,
                            node_id = %dispatch.handle.node_id,
                            item_id = %dispatch.handle.item_id,
                            error = %e,
                            "Poll failed, dropping handle"
                        );
                    }
                }
            }

            // Fail over handles stuck on nodes the health monitor took offline.
            let offline: Vec<PendingDispatch> = {
                let reg = registry.read().await;
                still_pending
                    .iter()
                    .filter(|d| {
                        reg.get(&d.handle.node_id)
                            .map(|n| n.status == NodeStatus::Offline)
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            };
            let mut reassigned: Vec<(PendingDispatch, String)> = Vec::new();
            if !offline.is_empty() {
                let replacement = {
                    let reg = registry.read().await;
                    reg.allocatable()
                        .into_iter()
                        .max_by(|a, b| {
                            a.capacity_score()
                                .partial_cmp(&b.capacity_score())
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|n| n.id)
                };
                if let Some(target) = replacement {
                    for dispatch in &offline {
                        let manifest = &manifests[dispatch.manifest_idx];
                        match dispatcher.submit(&target, manifest).await {
                            Ok(handle) => {
                                tracing::info!(
                                    batch_id = %batch_id,
                                    item_id = %manifest.item_id,
                                    from = %dispatch.handle.node_id,
                                    to = %target,
                                    "Failed over item to healthy node"
                                );
                                reassigned.push((
                                    PendingDispatch {
                                        handle,
                                        manifest_idx: dispatch.manifest_idx,
                                    },
                                    dispatch.handle.id.to_string(),
                                ));
                            }
                            Err(e) => {
                                tracing::warn!(
                                    batch_id = %batch_id,
                                    item_id = %manifest.item_id,
                                    error = %e,
                                    "Failover dispatch rejected"
                                );
                            }
                        }
                    }
                }
            }

            // Fold EMA observations into node history.
            if !resolved.is_empty() {
                let alpha = config.health.ema_alpha;
                let mut reg = registry.write().await;
                for outcome in &resolved {
                    if !outcome.node_id.is_empty() {
                        reg.record_outcome(
                            &outcome.node_id,
                            outcome.duration_ms,
                            outcome.success,
                            alpha,
                        );
                    }
                }
            }

            let mut map = batches.write().await;
            let Some(entry) = map.get_mut(&batch_id) else {
                return;
            };
            if entry.job.state.is_terminal() {
                return;
            }

            // First result per item wins; redundant lanes' later results drop.
            for outcome in resolved {
                entry
                    .outcomes
                    .entry(outcome.item_id.clone())
                    .or_insert(outcome);
            }

            let replaced_ids: Vec<String> =
                reassigned.iter().map(|(_, old)| old.clone()).collect();
            let failover_nodes: Vec<String> = reassigned
                .iter()
                .map(|(d, _)| d.handle.node_id.clone())
                .collect();
            let outcomes = &entry.outcomes;
            let next_pending: Vec<PendingDispatch> = still_pending
                .into_iter()
                .filter(|d| {
                    !replaced_ids.contains(&d.handle.id.to_string())
                        && !outcomes.contains_key(&d.handle.item_id)
                })
                .chain(reassigned.into_iter().map(|(d, _)| d))
                .collect();
            entry.pending = next_pending;

            // Amend the assignment with the failover targets only.
            if let Some(primary) = entry.job.allocation.subsets.first_mut() {
                for node_id in failover_nodes {
                    if !primary.contains(&node_id) {
                        primary.push(node_id);
                    }
                }
            }

            // Items no lane will ever report on get a synthetic failure so
            // the batch still terminates.
            if entry.pending.is_empty() {
                for manifest in &entry.job.manifests {
                    entry
                        .outcomes
                        .entry(manifest.item_id.clone())
                        .or_insert_with(|| {
                            ItemOutcome::rejected(
                                manifest.item_id.clone(),
                                "no node accepted this item",
                            )
                        });
                }
            }

            let all_resolved = entry
                .job
                .manifests
                .iter()
                .all(|m| entry.outcomes.contains_key(&m.item_id));

            if all_resolved {
                let total = entry.job.total_items();
                let succeeded = entry.outcomes.values().filter(|o| o.success).count();
                let rate = if total == 0 {
                    1.0
                } else {
                    succeeded as f64 / total as f64
                };
                let state = if rate >= config.batch.success_floor {
                    BatchState::Completed
                } else {
                    BatchState::Failed
                };
                entry.finalize(state);
                return;
            }

            if elapsed >= deadline {
                tracing::warn!(
                    batch_id = %batch_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch deadline elapsed, preserving partial results"
                );
                entry.finalize(BatchState::TimedOut);
                return;
            }
        }
    }

    /// Current state plus an advisory progress estimate.
    pub async fn status(&self, batch_id: Uuid) -> Result<BatchStatus> {
        let map = self.batches.read().await;
        let entry = map
            .get(&batch_id)
            .ok_or(GridError::BatchNotFound(batch_id))?;

        let succeeded = entry.outcomes.values().filter(|o| o.success).count();
        let failed = entry.outcomes.len() - succeeded;

        let progress_pct = if entry.job.state.is_terminal() {
            100.0
        } else {
            let assigned = entry.job.allocation.distinct_nodes();
            let avg_ms = {
                let reg = self.registry.read().await;
                let history: Vec<f64> = assigned
                    .iter()
                    .filter_map(|id| reg.get(id))
                    .map(|n| n.avg_job_duration_ms)
                    .filter(|ms| *ms > 0.0)
                    .collect();
                if history.is_empty() {
                    self.config.batch.default_item_duration.as_secs_f64() * 1000.0
                } else {
                    history.iter().sum::<f64>() / history.len() as f64
                }
            };
            estimate_progress(
                entry.started.elapsed(),
                entry.job.total_items(),
                Duration::from_secs_f64(avg_ms / 1000.0),
                assigned.len(),
            )
        };

        Ok(BatchStatus {
            batch_id,
            state: entry.job.state,
            progress_pct,
            total_items: entry.job.total_items(),
            succeeded,
            failed,
        })
    }

    /// Block until the batch reaches a terminal state or `timeout` elapses.
    ///
    /// A timeout forces the batch to `timed_out` and still returns the
    /// partial result: callers always receive a [`BatchResult`], so partial
    /// progress is never silently lost.
    pub async fn await_completion(&self, batch_id: Uuid, timeout: Duration) -> Result<BatchResult> {
        let mut state_rx = {
            let map = self.batches.read().await;
            let entry = map
                .get(&batch_id)
                .ok_or(GridError::BatchNotFound(batch_id))?;
            if entry.job.state.is_terminal() {
                if let Some(result) = &entry.result {
                    return Ok(result.clone());
                }
            }
            entry.state_tx.subscribe()
        };

        let wait = async {
            loop {
                if state_rx.borrow_and_update().is_terminal() {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(timeout, wait).await.is_err() {
            return self.force_timeout(batch_id).await;
        }

        let map = self.batches.read().await;
        let entry = map
            .get(&batch_id)
            .ok_or(GridError::BatchNotFound(batch_id))?;
        entry
            .result
            .clone()
            .ok_or_else(|| GridError::Internal("terminal batch without result".to_string()))
    }

    /// Transition a still-running batch to `timed_out` and aggregate what
    /// completed so far. The scheduler stops waiting; dispatched remote work
    /// is fire-and-forget and cannot be recalled.
    async fn force_timeout(&self, batch_id: Uuid) -> Result<BatchResult> {
        let mut map = self.batches.write().await;
        let entry = map
            .get_mut(&batch_id)
            .ok_or(GridError::BatchNotFound(batch_id))?;

        if !entry.job.state.is_terminal() {
            entry.finalize(BatchState::TimedOut);
        }
        entry
            .result
            .clone()
            .ok_or_else(|| GridError::Internal("terminal batch without result".to_string()))
    }

    /// Number of batches still being monitored.
    pub async fn active_batches(&self) -> usize {
        let map = self.batches.read().await;
        map.values().filter(|e| !e.job.state.is_terminal()).count()
    }
}
