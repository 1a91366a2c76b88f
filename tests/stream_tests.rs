//! Tests for the streaming micro-batch pipeline.
//!
//! Verifies micro-batch sizing, partial-buffer flush on stream end,
//! per-item callback delivery, and that an empty pool fails the stream
//! synchronously.


use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use test_harness::{fast_config, grid_with_nodes, work_items, ScriptedDispatcher};
use tokio::sync::mpsc;
use workgrid::error::GridError;

const POOL: &[(&str, &str, u32)] = &[("n1", "us-east", 8), ("n2", "us-east", 8)];

/// Feeding one item fewer than the micro-batch size and closing the input
/// flushes exactly one micro-batch carrying all of those items.
#[tokio::test]
async fn partial_buffer_flushes_on_close() {
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(2)));
    let service = grid_with_nodes(fast_config(), dispatcher, POOL).await;

    // fast_config uses a micro-batch size of 10; send 9.
    let (tx, rx) = mpsc::channel(16);
    for item in work_items(9) {
        tx.send(item).await.unwrap();
    }
    drop(tx);

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_cb = delivered.clone();
    let summary = service
        .process_stream(
            rx,
            Arc::new(move |_, _| {
                delivered_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    assert_eq!(summary.micro_batches, 1);
    assert_eq!(summary.items_consumed, 9);
    assert_eq!(summary.items_delivered, 9);
    assert_eq!(delivered.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn full_batches_plus_remainder() {
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(2)));
    let service = grid_with_nodes(fast_config(), dispatcher, POOL).await;

    let (tx, rx) = mpsc::channel(16);
    let producer = tokio::spawn(async move {
        for item in work_items(25) {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_cb = delivered.clone();
    let summary = service
        .process_stream(
            rx,
            Arc::new(move |_, _| {
                delivered_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    producer.await.unwrap();

    // 25 items at micro-batch 10: two full batches plus a flushed remainder.
    assert_eq!(summary.micro_batches, 3);
    assert_eq!(summary.items_consumed, 25);
    assert_eq!(summary.items_delivered, 25);
    assert_eq!(delivered.load(Ordering::SeqCst), 25);
}

/// Every item's callback fires exactly once, even for failures.
#[tokio::test]
async fn callback_fires_once_per_item() {
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(2)));
    dispatcher.fail_item("item-0004");
    let service = grid_with_nodes(fast_config(), dispatcher, POOL).await;

    let (tx, rx) = mpsc::channel(16);
    let producer = tokio::spawn(async move {
        for item in work_items(20) {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    service
        .process_stream(
            rx,
            Arc::new(move |item_id, outcome| {
                seen_cb
                    .lock()
                    .unwrap()
                    .push((item_id.to_string(), outcome.success));
            }),
        )
        .await
        .unwrap();
    producer.await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 20);
    let mut ids: Vec<&String> = seen.iter().map(|(id, _)| id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20, "no item should be delivered twice");
    assert!(seen.iter().any(|(id, ok)| id == "item-0004" && !ok));
}

#[tokio::test]
async fn stream_spreads_batches_across_subset() {
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(2)));
    let service = grid_with_nodes(fast_config(), dispatcher.clone(), POOL).await;

    let (tx, rx) = mpsc::channel(16);
    let producer = tokio::spawn(async move {
        for item in work_items(40) {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    service
        .process_stream(rx, Arc::new(|_, _| {}))
        .await
        .unwrap();
    producer.await.unwrap();

    // Four micro-batches round-robin over a two-node subset.
    assert!(dispatcher.submissions_to("n1") > 0);
    assert!(dispatcher.submissions_to("n2") > 0);
}

#[tokio::test]
async fn empty_pool_fails_stream_synchronously() {
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(2)));
    let service = grid_with_nodes(fast_config(), dispatcher, &[]).await;

    let (tx, rx) = mpsc::channel::<workgrid::manifest::WorkItem>(4);
    drop(tx);

    let err = service
        .process_stream(rx, Arc::new(|_, _| {}))
        .await
        .expect_err("no nodes available");
    assert!(matches!(err, GridError::NoCapacityAvailable { .. }));
}

#[tokio::test]
async fn empty_stream_yields_empty_summary() {
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(2)));
    let service = grid_with_nodes(fast_config(), dispatcher, POOL).await;

    let (tx, rx) = mpsc::channel::<workgrid::manifest::WorkItem>(4);
    drop(tx);

    let summary = service.process_stream(rx, Arc::new(|_, _| {})).await.unwrap();
    assert_eq!(summary.items_consumed, 0);
    assert_eq!(summary.items_delivered, 0);
    assert_eq!(summary.micro_batches, 0);
}
