//! Point Batcher
//!
//! Accumulates points and flushes them as batches when either the size
//! threshold is reached or the batch timeout elapses after the first point of
//! the batch, whichever comes first.
//!
//! Flushed batches wait in a bounded output queue. When the consumer falls
//! behind by more than `pending` batches the batcher task blocks, its input
//! queue fills up, and submitters block in turn.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::{
    error::{BridgeError, BridgeResult},
    types::{Batch, Point},
};

/// Largest capacity a bounded tokio channel accepts
pub const MAX_CHANNEL_CAPACITY: usize = usize::MAX >> 3;

/// Upper bound on points preallocated for one batch
const MAX_PREALLOCATED_POINTS: usize = 65_536;

/// Batcher configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Maximum points per batch
    pub size: usize,
    /// Maximum flushed batches waiting for the consumer
    pub pending: usize,
    /// Maximum time a batch stays open after its first point
    pub timeout: Duration,
}

impl BatcherConfig {
    fn validate(&self) -> BridgeResult<()> {
        if self.size == 0 {
            return Err(BridgeError::configuration("Batch size cannot be zero"));
        }
        if self.pending == 0 {
            return Err(BridgeError::configuration("Batch pending cannot be zero"));
        }
        if self.timeout.is_zero() {
            return Err(BridgeError::configuration("Batch timeout cannot be zero"));
        }
        match self.size.checked_mul(self.pending) {
            Some(capacity) if capacity <= MAX_CHANNEL_CAPACITY => Ok(()),
            _ => Err(BridgeError::configuration(format!(
                "Batch size {} times batch pending {} exceeds the queue limit of {MAX_CHANNEL_CAPACITY}",
                self.size, self.pending
            ))),
        }
    }

    fn input_capacity(&self) -> usize {
        self.size * self.pending
    }

    fn preallocated(&self) -> usize {
        self.size.min(MAX_PREALLOCATED_POINTS)
    }
}

/// Batcher statistics
#[derive(Debug, Default)]
pub struct BatcherStats {
    batches_emitted: AtomicU64,
    points_emitted: AtomicU64,
    size_flushes: AtomicU64,
    timeout_flushes: AtomicU64,
}

/// Point-in-time copy of [`BatcherStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherStatsSnapshot {
    /// Batches handed to the output queue
    pub batches_emitted: u64,
    /// Points handed to the output queue
    pub points_emitted: u64,
    /// Flushes caused by the size threshold
    pub size_flushes: u64,
    /// Flushes caused by the batch timeout
    pub timeout_flushes: u64,
}

impl BatcherStats {
    /// Take a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> BatcherStatsSnapshot {
        BatcherStatsSnapshot {
            batches_emitted: self.batches_emitted.load(Ordering::Relaxed),
            points_emitted: self.points_emitted.load(Ordering::Relaxed),
            size_flushes: self.size_flushes.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Why a batch left the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Size,
    Timeout,
    Forced,
    Shutdown,
}

/// Commands for the batcher task
#[derive(Debug, Clone, Copy)]
enum Control {
    Flush,
    Stop,
}

/// Producer side of the batcher
#[derive(Debug, Clone)]
pub struct PointSubmitter {
    tx: mpsc::Sender<Point>,
}

impl PointSubmitter {
    /// Submit one point, waiting while the batcher applies backpressure
    ///
    /// # Errors
    ///
    /// Returns error if the batcher has stopped accepting points
    pub async fn submit(&self, point: Point) -> BridgeResult<()> {
        self.tx
            .send(point)
            .await
            .map_err(|_| BridgeError::batcher("Batcher is not accepting points"))
    }
}

/// Size- and time-triggered point batcher
#[derive(Debug)]
pub struct PointBatcher {
    config: BatcherConfig,
    stats: Arc<BatcherStats>,
    input: Option<mpsc::Sender<Point>>,
    output: Option<mpsc::Receiver<Batch>>,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
}

impl PointBatcher {
    /// Create a new, stopped batcher
    ///
    /// # Errors
    ///
    /// Returns error if size, pending or timeout is zero, or if the queues
    /// they imply exceed [`MAX_CHANNEL_CAPACITY`]
    pub fn new(size: usize, pending: usize, timeout: Duration) -> BridgeResult<Self> {
        let config = BatcherConfig {
            size,
            pending,
            timeout,
        };
        config.validate()?;

        Ok(Self {
            config,
            stats: Arc::new(BatcherStats::default()),
            input: None,
            output: None,
            control: None,
            task: None,
        })
    }

    /// Start the batcher task. Starting a running batcher does nothing.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let (input_tx, input_rx) = mpsc::channel(self.config.input_capacity());
        let (output_tx, output_rx) = mpsc::channel(self.config.pending);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        self.task = Some(tokio::spawn(Self::run(
            self.config,
            Arc::clone(&self.stats),
            input_rx,
            output_tx,
            control_rx,
        )));
        self.input = Some(input_tx);
        self.output = Some(output_rx);
        self.control = Some(control_tx);

        tracing::debug!(
            size = self.config.size,
            pending = self.config.pending,
            timeout = ?self.config.timeout,
            "Point batcher started"
        );
    }

    /// Submission handle, `None` unless running
    #[must_use]
    pub fn submitter(&self) -> Option<PointSubmitter> {
        self.input.as_ref().map(|tx| PointSubmitter { tx: tx.clone() })
    }

    /// Take the retrieval side. It yields `None` once the batcher has stopped
    /// and every flushed batch has been received.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Batch>> {
        self.output.take()
    }

    /// Flush the current partial batch immediately
    pub fn flush(&self) {
        if let Some(control) = &self.control {
            let _ = control.send(Control::Flush);
        }
    }

    /// Stop accepting points, flush the partial batch and close the output.
    ///
    /// Waits for the batcher task, so the output must still be drained by
    /// someone if pending batches are queued.
    pub async fn stop(&mut self) {
        self.input = None;
        if let Some(control) = self.control.take() {
            let _ = control.send(Control::Stop);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Point batcher task failed");
            }
        }
    }

    /// Whether the batcher task is running
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Batcher statistics
    #[must_use]
    pub fn stats(&self) -> BatcherStatsSnapshot {
        self.stats.snapshot()
    }

    async fn run(
        config: BatcherConfig,
        stats: Arc<BatcherStats>,
        mut input: mpsc::Receiver<Point>,
        output: mpsc::Sender<Batch>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        let mut batch = Batch::with_capacity(config.preallocated());
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::Flush) => {
                        Self::emit(&output, &mut batch, &stats, config.preallocated(), FlushReason::Forced).await;
                        deadline = None;
                    }
                    Some(Control::Stop) | None => break,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Self::emit(&output, &mut batch, &stats, config.preallocated(), FlushReason::Timeout).await;
                    deadline = None;
                }
                point = input.recv() => match point {
                    Some(point) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + config.timeout);
                        }
                        batch.push(point);
                        if batch.len() >= config.size {
                            Self::emit(&output, &mut batch, &stats, config.preallocated(), FlushReason::Size).await;
                            deadline = None;
                        }
                    }
                    None => break,
                },
            }
        }

        // Points already accepted are still delivered.
        input.close();
        while let Some(point) = input.recv().await {
            batch.push(point);
            if batch.len() >= config.size {
                Self::emit(&output, &mut batch, &stats, config.preallocated(), FlushReason::Size).await;
            }
        }
        Self::emit(&output, &mut batch, &stats, config.preallocated(), FlushReason::Shutdown).await;

        tracing::debug!("Point batcher stopped");
    }

    async fn emit(
        output: &mpsc::Sender<Batch>,
        batch: &mut Batch,
        stats: &BatcherStats,
        preallocated: usize,
        reason: FlushReason,
    ) {
        if batch.is_empty() {
            return;
        }

        let flushed = std::mem::replace(batch, Batch::with_capacity(preallocated));
        let points = flushed.len();

        match reason {
            FlushReason::Size => {
                stats.size_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushReason::Timeout => {
                stats.timeout_flushes.fetch_add(1, Ordering::Relaxed);
            }
            FlushReason::Forced | FlushReason::Shutdown => {}
        }

        if output.send(flushed).await.is_err() {
            tracing::warn!(points, ?reason, "Batch consumer is gone, dropping batch");
            return;
        }

        stats.batches_emitted.fetch_add(1, Ordering::Relaxed);
        stats
            .points_emitted
            .fetch_add(u64::try_from(points).unwrap_or(u64::MAX), Ordering::Relaxed);
        tracing::trace!(points, ?reason, "Batch flushed");
    }
}

impl Drop for PointBatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
