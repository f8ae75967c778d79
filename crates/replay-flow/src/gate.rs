// Flow-control gate around a chunk source.
//
// The gate keeps two instants: the latest timestamp seen in any chunk read so
// far, and a high-watermark (`stop_reading_at`) that callers push forward with
// `stop_reads_past`. Reads park while the watermark is behind the last seen
// timestamp, and every returned batch holds cost against the outstanding-work
// pool until the consumer acknowledges it with `done_processing`.
//
// Concurrency contract:
// - Any number of callers may call `stop_reads_past` / `done_processing`
//   concurrently through cloned `FlowController` handles.
// - Exactly one reader: `read_next_traffic_stream_chunk` takes `&mut self`.
// - The watermark lives in a `watch` channel. Advancing it coalesces every
//   pending wake-up into one notification, which is all a single reader needs.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{FlowError, Result};
use crate::key::{ConnectionKey, TrafficChunk};
use crate::outstanding::OutstandingWorkTracker;
use crate::source::{ChunkBatch, ChunkSource, TrafficCaptureSource};

/// Caller-side controls on a gate.
pub trait BufferedFlowController: Send + Sync {
    /// Allow reads up to `point_in_time` plus the buffer window.
    ///
    /// Returns true when the watermark moved.
    fn stop_reads_past(&self, point_in_time: SystemTime) -> bool;

    /// One completion signal for a chunk previously handed out.
    fn done_processing(&self, key: &ConnectionKey) -> Result<()>;

    fn buffer_time_window(&self) -> Duration;
}

type ChunkWeightFn = Box<dyn Fn(&TrafficChunk) -> u32 + Send + Sync>;

#[derive(Debug)]
struct FlowControlShared {
    buffer_time_window: Duration,
    // None until the first `stop_reads_past`.
    stop_reading_at: watch::Sender<Option<SystemTime>>,
    // Only the reader writes this.
    last_observed: Mutex<SystemTime>,
    outstanding: OutstandingWorkTracker,
}

/// Cloneable handle for advancing the watermark and acknowledging work.
#[derive(Debug, Clone)]
pub struct FlowController {
    shared: Arc<FlowControlShared>,
}

impl FlowController {
    fn new(buffer_time_window: Duration, max_concurrent_cost: u32) -> Result<Self> {
        let (stop_reading_at, _) = watch::channel(None);
        Ok(Self {
            shared: Arc::new(FlowControlShared {
                buffer_time_window,
                stop_reading_at,
                last_observed: Mutex::new(UNIX_EPOCH),
                outstanding: OutstandingWorkTracker::new(max_concurrent_cost)?,
            }),
        })
    }

    pub fn stop_reading_at(&self) -> Option<SystemTime> {
        *self.shared.stop_reading_at.borrow()
    }

    pub fn last_observed_time(&self) -> SystemTime {
        *self.shared.last_observed.lock()
    }

    pub fn outstanding(&self) -> &OutstandingWorkTracker {
        &self.shared.outstanding
    }

    fn reader_is_parked(&self) -> bool {
        // A parked reader is the only subscriber the gate ever creates.
        self.shared.stop_reading_at.receiver_count() > 0
    }

    fn observe_timestamp(&self, timestamp: SystemTime) {
        let mut last = self.shared.last_observed.lock();
        if timestamp > *last {
            *last = timestamp;
        }
    }

    async fn wait_for_read_window(&self) -> Result<()> {
        let last_observed = self.last_observed_time();
        let mut stop_rx = self.shared.stop_reading_at.subscribe();
        let permitted = |stop: &Option<SystemTime>| matches!(*stop, Some(stop) if stop >= last_observed);
        if !permitted(&*stop_rx.borrow_and_update()) {
            tracing::info!(
                last = ?last_observed,
                stop = ?self.stop_reading_at(),
                "blocking until signaled to read the next chunk"
            );
        }
        if stop_rx.wait_for(permitted).await.is_err() {
            tracing::warn!("watermark signal dropped while waiting to read more data");
            return Err(FlowError::InterruptedWait("watermark signal dropped"));
        }
        Ok(())
    }
}

impl BufferedFlowController for FlowController {
    fn stop_reads_past(&self, point_in_time: SystemTime) -> bool {
        let buffer = self.shared.buffer_time_window;
        let candidate = point_in_time.checked_add(buffer).unwrap_or(point_in_time);
        let advanced = self.shared.stop_reading_at.send_if_modified(|current| match current {
            Some(existing) if *existing >= candidate => false,
            _ => {
                *current = Some(candidate);
                true
            }
        });
        if advanced {
            metrics::counter!("replay_watermark_advances_total").increment(1);
            if self.reader_is_parked() {
                tracing::info!(stop_reading_at = ?candidate, "releasing the block on reads");
            } else {
                tracing::trace!(stop_reading_at = ?candidate, "advanced read watermark");
            }
        } else {
            tracing::trace!(
                point_in_time = ?point_in_time,
                candidate = ?candidate,
                current = ?self.stop_reading_at(),
                "stop_reads_past did not move the watermark"
            );
        }
        advanced
    }

    fn done_processing(&self, key: &ConnectionKey) -> Result<()> {
        self.shared.outstanding.done_processing(key).map(|_| ())
    }

    fn buffer_time_window(&self) -> Duration {
        self.shared.buffer_time_window
    }
}

/// Single-reader source wrapper that paces reads by time and bounds
/// unacknowledged cost.
///
/// ```
/// use replay_flow::{BlockingTrafficSource, BufferedFlowController, ChunkSource, ChunkBatch};
/// use std::future::Future;
/// use std::pin::Pin;
/// use std::time::{Duration, SystemTime};
///
/// struct Empty;
///
/// impl ChunkSource for Empty {
///     fn read_next_chunk(
///         &mut self,
///     ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChunkBatch>> + Send + '_>> {
///         Box::pin(async { Ok(Vec::new()) })
///     }
///
///     fn close(&mut self) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut gate =
///         BlockingTrafficSource::new(Empty, Duration::from_secs(5), 16, |_| 1, |_| 1)
///             .expect("gate");
///     gate.controller().stop_reads_past(SystemTime::now());
///     let batch = gate.read_next_traffic_stream_chunk().await.expect("read");
///     assert!(batch.is_empty());
/// });
/// ```
pub struct BlockingTrafficSource<S> {
    underlying: S,
    controller: FlowController,
    compute_expected_signals: ChunkWeightFn,
    compute_cost: ChunkWeightFn,
}

impl<S: ChunkSource> BlockingTrafficSource<S> {
    pub fn new(
        underlying: S,
        buffer_time_window: Duration,
        max_concurrent_cost: u32,
        compute_expected_signals: impl Fn(&TrafficChunk) -> u32 + Send + Sync + 'static,
        compute_cost: impl Fn(&TrafficChunk) -> u32 + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            underlying,
            controller: FlowController::new(buffer_time_window, max_concurrent_cost)?,
            compute_expected_signals: Box::new(compute_expected_signals),
            compute_cost: Box::new(compute_cost),
        })
    }

    pub fn controller(&self) -> FlowController {
        self.controller.clone()
    }

    /// Read the next batch that starts before the current watermark.
    ///
    /// The watermark is a soft barrier: it is checked against timestamps seen
    /// in earlier batches, so one batch may run past it. Cost is charged after
    /// the batch is read because it is unknown until then.
    ///
    /// # Cancel safety
    ///
    /// Not cancel safe. Dropping the future while it waits on the watermark
    /// loses nothing, but dropping it while it waits for cost loses the batch
    /// already taken from the source; only its registrations are rolled back.
    pub async fn read_next_traffic_stream_chunk(&mut self) -> Result<ChunkBatch> {
        self.controller.wait_for_read_window().await?;
        let batch = self
            .underlying
            .read_next_chunk()
            .await
            .map_err(FlowError::Source)?;
        // Borrow only the Sync parts across the cost wait.
        charge_batch(
            &self.controller,
            &self.compute_expected_signals,
            &self.compute_cost,
            &batch,
        )
        .await?;

        if let Some(max_observed) = batch
            .iter()
            .filter_map(|item| item.chunk().max_timestamp())
            .max()
        {
            self.controller.observe_timestamp(max_observed);
        }
        tracing::trace!(
            chunks = batch.len(),
            last_observed = ?self.controller.last_observed_time(),
            "end of read_next_traffic_stream_chunk"
        );
        Ok(batch)
    }

    /// Close the underlying source.
    ///
    /// A read parked on the watermark or the cost pool is not woken; drop its
    /// future to cancel it.
    pub fn close(&mut self) -> Result<()> {
        self.underlying.close().map_err(FlowError::Source)
    }
}

async fn charge_batch(
    controller: &FlowController,
    compute_expected_signals: &ChunkWeightFn,
    compute_cost: &ChunkWeightFn,
    batch: &ChunkBatch,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let outstanding = controller.outstanding();
    let pending = outstanding.register_batch(batch.iter().map(|item| {
        (
            item.key().clone(),
            compute_expected_signals(item.chunk()),
            compute_cost(item.chunk()),
        )
    }))?;
    tracing::debug!(
        available = outstanding.available_capacity(),
        acquiring = pending.total_cost(),
        chunks = batch.len(),
        "charging batch against outstanding cost"
    );
    outstanding.acquire(pending.total_cost()).await?;
    pending.commit();
    Ok(())
}

impl<S: ChunkSource + Sync> BufferedFlowController for BlockingTrafficSource<S> {
    fn stop_reads_past(&self, point_in_time: SystemTime) -> bool {
        self.controller.stop_reads_past(point_in_time)
    }

    fn done_processing(&self, key: &ConnectionKey) -> Result<()> {
        self.controller.done_processing(key)
    }

    fn buffer_time_window(&self) -> Duration {
        self.controller.buffer_time_window()
    }
}

impl<S: ChunkSource> TrafficCaptureSource for BlockingTrafficSource<S> {
    fn read_next_traffic_stream_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkBatch>> + Send + '_>> {
        Box::pin(BlockingTrafficSource::read_next_traffic_stream_chunk(self))
    }

    fn close(&mut self) -> Result<()> {
        BlockingTrafficSource::close(self)
    }
}

impl<S> std::fmt::Debug for BlockingTrafficSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingTrafficSource")
            .field("buffer_time_window", &self.controller.shared.buffer_time_window)
            .field("last_observed", &self.controller.last_observed_time())
            .field("stop_reading_at", &self.controller.stop_reading_at())
            .field("held_cost", &self.controller.outstanding().held_cost())
            .finish()
    }
}
