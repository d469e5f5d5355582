//! Progress reporting for long-running passes.
//!
//! Reporting is best effort: a sink that fails is logged at debug level and
//! otherwise ignored, and sinks must never block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Default interval between two throttled log lines.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(15);

/// Stage of a refresh or aggregation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Types,
    Entities,
    Relationships,
    Adjacency,
    Eviction,
    MetaGraph,
}

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    PhaseStarted(Phase),
    PhaseCompleted { phase: Phase, elapsed_ms: u64 },
    Entities {
        source: String,
        processed: u64,
        total: Option<u64>,
    },
    Relationships {
        source: String,
        processed: u64,
        total: Option<u64>,
    },
    Adjacency { forward: u64, backward: u64 },
}

/// Receiver of progress counters.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent) -> Result<(), AppError>;
}

/// Reports `event`, swallowing sink failures.
pub fn notify(sink: &dyn ProgressSink, event: ProgressEvent) {
    if let Err(err) = sink.report(&event) {
        tracing::debug!(error = %err, ?event, "progress sink failed");
    }
}

/// Lets at most one call through per interval.
#[derive(Debug)]
pub struct Throttle {
    interval_ms: u64,
    started: Instant,
    next_ms: AtomicU64,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            started: Instant::now(),
            next_ms: AtomicU64::new(0),
        }
    }

    /// True for the first call and then once per interval.
    pub fn ready(&self) -> bool {
        let now = self.started.elapsed().as_millis() as u64;
        let next = self.next_ms.load(Ordering::Relaxed);
        if now < next {
            return false;
        }
        self.next_ms
            .compare_exchange(next, now + self.interval_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

/// Logs phase boundaries always and counters at most once per interval.
#[derive(Debug, Default)]
pub struct LoggingProgress {
    throttle: Throttle,
}

impl LoggingProgress {
    pub fn new(interval: Duration) -> Self {
        Self {
            throttle: Throttle::new(interval),
        }
    }
}

impl ProgressSink for LoggingProgress {
    fn report(&self, event: &ProgressEvent) -> Result<(), AppError> {
        match event {
            ProgressEvent::PhaseStarted(phase) => tracing::info!(?phase, "phase started"),
            ProgressEvent::PhaseCompleted { phase, elapsed_ms } => {
                tracing::info!(?phase, elapsed_ms, "phase completed")
            }
            ProgressEvent::Entities {
                source,
                processed,
                total,
            } if self.throttle.ready() => {
                tracing::info!(%source, processed, ?total, "entities processed")
            }
            ProgressEvent::Relationships {
                source,
                processed,
                total,
            } if self.throttle.ready() => {
                tracing::info!(%source, processed, ?total, "relationships processed")
            }
            ProgressEvent::Adjacency { forward, backward } => {
                tracing::info!(forward, backward, "adjacency lists written")
            }
            _ => {}
        }
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _event: &ProgressEvent) -> Result<(), AppError> {
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingProgress {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, event: &ProgressEvent) -> Result<(), AppError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| AppError::Internal("progress recorder poisoned".to_string()))?;
        events.push(event.clone());
        Ok(())
    }
}
