//! Streaming building blocks for the refresh and aggregation passes.
//!
//! A pass is a bounded producer feeding a router that hashes each item's key
//! into one of K worker lanes; the lanes process independently and send their
//! outputs into one merged channel read by a single coordinator.
//!
//! ```text
//! source stream ──► bounded queue ──► router ──┬─► lane 0 ──┐
//!                                              ├─► lane 1 ──┼──► merged ──► coordinator
//!                                              └─► lane K ──┘
//! ```
//!
//! Items with the same key always land on the same lane. The merged output
//! does not preserve arrival order; every item a worker accepts is emitted
//! exactly once.

mod cancel;

pub use cancel::CancellationToken;

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::AppError;

/// Lane index for a partitioning key.
pub fn lane_for(key: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Counters of one producer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub sent: u64,
    /// Items the stream reported as malformed.
    pub skipped: u64,
}

/// Drains `stream` into a bounded sender.
///
/// Malformed items (validation or deserialization errors) are logged and
/// skipped; any other error stops the producer and is returned. Stops
/// quietly when cancelled or when the receiving side has gone away.
pub async fn produce<T, S>(
    label: &str,
    stream: S,
    sender: mpsc::Sender<T>,
    cancel: &CancellationToken,
) -> Result<ProducerStats, AppError>
where
    S: Stream<Item = Result<T, AppError>> + Send,
    T: Send,
{
    let mut stream = std::pin::pin!(stream);
    let mut stats = ProducerStats::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let item = match next {
            Some(Ok(item)) => item,
            Some(Err(err @ (AppError::Validation(_) | AppError::Serialization(_)))) => {
                stats.skipped += 1;
                tracing::debug!(producer = label, error = %err, "skipping malformed item");
                continue;
            }
            Some(Err(err)) => return Err(err),
            None => break,
        };

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = sender.send(item) => sent,
        };
        if sent.is_err() {
            break;
        }
        stats.sent += 1;
    }

    Ok(stats)
}

/// Routes `input` into `lanes` workers by key and merges their outputs.
///
/// `worker` runs once per item on the item's lane; returning `None` drops the
/// item. The returned receiver closes after the input closes and every lane
/// has drained, or promptly after cancellation.
pub fn fan_out<T, O, K, W, Fut>(
    mut input: mpsc::Receiver<T>,
    lanes: usize,
    capacity: usize,
    key: K,
    worker: W,
    cancel: CancellationToken,
) -> mpsc::Receiver<O>
where
    T: Send + 'static,
    O: Send + 'static,
    K: Fn(&T) -> String + Send + 'static,
    W: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<O>> + Send + 'static,
{
    let lanes = lanes.max(1);
    let capacity = capacity.max(1);
    let (merged_tx, merged_rx) = mpsc::channel(capacity);
    let worker = Arc::new(worker);

    let mut lane_senders = Vec::with_capacity(lanes);
    for lane in 0..lanes {
        let (lane_tx, mut lane_rx) = mpsc::channel::<T>(capacity);
        lane_senders.push(lane_tx);

        let merged_tx = merged_tx.clone();
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut processed = 0u64;
            while let Some(item) = lane_rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                processed += 1;
                if let Some(output) = worker(item).await {
                    if merged_tx.send(output).await.is_err() {
                        break;
                    }
                }
            }
            tracing::trace!(lane, processed, "lane drained");
        });
    }
    drop(merged_tx);

    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = input.recv() => item,
            };
            let Some(item) = item else { break };
            let lane = lane_for(&key(&item), lanes);
            if lane_senders[lane].send(item).await.is_err() {
                break;
            }
        }
    });

    merged_rx
}
