//! Streaming micro-batch pipeline.
//!
//! Consumes a possibly unbounded item sequence, buffers it into bounded
//! micro-batches, and dispatches each batch to a pre-selected low-load node
//! subset. Dispatch is non-blocking with respect to input consumption, with
//! at most one micro-batch in flight per subset node; when every node is
//! busy the intake waits for the next completion, so backpressure is
//! implicit and memory stays bounded at `micro_batch_size × subset size`.
//!
//! The result callback fires once per item in completion order. End-to-end
//! ordering is explicitly not guaranteed.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::allocator::{AllocationRequest, NodeAllocator, Strategy};
use crate::config::StreamConfig;
use crate::dispatch::{Dispatcher, ItemOutcome, PollState};
use crate::error::Result;
use crate::manifest::{JobManifest, WorkItem};

/// Callback invoked once per item as its result arrives.
pub type ResultCallback = Arc<dyn Fn(&str, &ItemOutcome) + Send + Sync>;

/// Bookkeeping for one in-progress stream. Discarded when the input ends.
#[derive(Debug)]
struct StreamSession {
    subset: Vec<String>,
    micro_batch_size: usize,
    items_consumed: usize,
    batches_dispatched: usize,
    cursor: usize,
}

impl StreamSession {
    fn next_node(&mut self) -> String {
        let node = self.subset[self.cursor % self.subset.len()].clone();
        self.cursor += 1;
        node
    }
}

/// Summary returned when the input sequence ends and all batches drain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamSummary {
    pub items_consumed: usize,
    pub items_delivered: usize,
    pub micro_batches: usize,
    pub nodes_used: Vec<String>,
}

pub struct StreamPipeline {
    allocator: Arc<NodeAllocator>,
    dispatcher: Arc<dyn Dispatcher>,
    config: StreamConfig,
}

impl StreamPipeline {
    pub fn new(
        allocator: Arc<NodeAllocator>,
        dispatcher: Arc<dyn Dispatcher>,
        config: StreamConfig,
    ) -> Self {
        Self {
            allocator,
            dispatcher,
            config,
        }
    }

    /// Consume `items` until the channel closes, dispatching micro-batches
    /// through the allocator's low-load subset. A partial buffer below the
    /// micro-batch threshold is flushed when the input ends, never dropped.
    pub async fn process_stream(
        &self,
        mut items: mpsc::Receiver<WorkItem>,
        on_result: ResultCallback,
    ) -> Result<StreamSummary> {
        let mut session = StreamSession {
            subset: self.select_subset().await?,
            micro_batch_size: self.config.micro_batch_size.max(1),
            items_consumed: 0,
            batches_dispatched: 0,
            cursor: 0,
        };
        tracing::info!(
            nodes = session.subset.len(),
            micro_batch_size = session.micro_batch_size,
            "Stream session started"
        );

        let mut nodes_used = session.subset.clone();
        let mut buffer: Vec<WorkItem> = Vec::with_capacity(session.micro_batch_size);
        let mut inflight: JoinSet<(String, usize)> = JoinSet::new();
        let mut busy: HashSet<String> = HashSet::new();
        let mut delivered = 0usize;

        while let Some(item) = items.recv().await {
            session.items_consumed += 1;
            buffer.push(item);

            if buffer.len() >= session.micro_batch_size {
                let batch = std::mem::replace(
                    &mut buffer,
                    Vec::with_capacity(session.micro_batch_size),
                );
                self.dispatch_batch(&mut session, batch, &on_result, &mut inflight, &mut busy, &mut delivered)
                    .await;

                // A long-lived stream re-selects its subset so placement
                // tracks drifting node load.
                if session.batches_dispatched % self.config.reselect_after_batches.max(1) == 0 {
                    if let Ok(subset) = self.select_subset().await {
                        for id in &subset {
                            if !nodes_used.contains(id) {
                                nodes_used.push(id.clone());
                            }
                        }
                        tracing::debug!(nodes = subset.len(), "Stream subset re-selected");
                        session.subset = subset;
                    }
                }
            }
        }

        // Input ended; flush the partial buffer immediately.
        if !buffer.is_empty() {
            self.dispatch_batch(
                &mut session,
                std::mem::take(&mut buffer),
                &on_result,
                &mut inflight,
                &mut busy,
                &mut delivered,
            )
            .await;
        }

        while let Some(joined) = inflight.join_next().await {
            if let Ok((_, count)) = joined {
                delivered += count;
            }
        }

        tracing::info!(
            items = session.items_consumed,
            delivered,
            batches = session.batches_dispatched,
            "Stream session finished"
        );

        Ok(StreamSummary {
            items_consumed: session.items_consumed,
            items_delivered: delivered,
            micro_batches: session.batches_dispatched,
            nodes_used,
        })
    }

    /// Low-load subset chosen via weighted capacity, sized for one
    /// micro-batch of work.
    async fn select_subset(&self) -> Result<Vec<String>> {
        let allocation = self
            .allocator
            .allocate(&AllocationRequest::new(
                self.config.micro_batch_size.max(1),
                Strategy::WeightedCapacity,
            ))
            .await?;
        Ok(allocation.primary().to_vec())
    }

    /// Dispatch one micro-batch to the next subset node, first waiting out
    /// any batch already in flight on that node. This is what bounds the
    /// pipeline to one micro-batch per node and gives implicit backpressure:
    /// intake stops pulling while every node is occupied.
    async fn dispatch_batch(
        &self,
        session: &mut StreamSession,
        batch: Vec<WorkItem>,
        on_result: &ResultCallback,
        inflight: &mut JoinSet<(String, usize)>,
        busy: &mut HashSet<String>,
        delivered: &mut usize,
    ) {
        let node_id = session.next_node();
        while busy.contains(&node_id) {
            match inflight.join_next().await {
                Some(Ok((finished, count))) => {
                    busy.remove(&finished);
                    *delivered += count;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Micro-batch task failed");
                    break;
                }
                None => break,
            }
        }
        busy.insert(node_id.clone());

        session.batches_dispatched += 1;
        let batch_no = session.batches_dispatched;
        let dispatcher = self.dispatcher.clone();
        let callback = on_result.clone();
        let poll_interval = self.config.poll_interval;

        tracing::debug!(batch_no, node_id = %node_id, items = batch.len(), "Micro-batch dispatched");

        inflight.spawn(async move {
            let count = run_micro_batch(dispatcher, node_id.clone(), batch, callback, poll_interval).await;
            (node_id, count)
        });
    }
}

/// Submit one micro-batch to a single node and deliver each item's outcome
/// through the callback as it completes. Returns the delivered-item count.
async fn run_micro_batch(
    dispatcher: Arc<dyn Dispatcher>,
    node_id: String,
    batch: Vec<WorkItem>,
    on_result: ResultCallback,
    poll_interval: std::time::Duration,
) -> usize {
    let mut delivered = 0usize;
    let mut handles = Vec::with_capacity(batch.len());

    for item in &batch {
        let manifest = JobManifest::wrap(item);
        match dispatcher.submit(&node_id, &manifest).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                tracing::warn!(node_id = %node_id, item_id = %item.id, error = %e, "Stream dispatch rejected");
                let outcome = ItemOutcome::rejected(item.id.clone(), e.to_string());
                on_result(&item.id, &outcome);
                delivered += 1;
            }
        }
    }

    let mut interval = tokio::time::interval(poll_interval);
    while !handles.is_empty() {
        interval.tick().await;
        let mut remaining = Vec::with_capacity(handles.len());
        for handle in handles.drain(..) {
            match dispatcher.poll(&handle).await {
                Ok(PollState::Done(outcome)) => {
                    on_result(&outcome.item_id, &outcome);
                    delivered += 1;
                }
                Ok(PollState::Pending) => remaining.push(handle),
                Err(e) => {
                    tracing::warn!(node_id = %node_id, item_id = %handle.item_id, error = %e, "Stream poll failed");
                    let outcome = ItemOutcome::rejected(handle.item_id.clone(), e.to_string());
                    on_result(&handle.item_id, &outcome);
                    delivered += 1;
                }
            }
        }
        handles = remaining;
    }

    delivered
}
