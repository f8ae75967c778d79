//! Replay loop.
//!
//! One reader pulls batches through the flow-control gate and routes each
//! chunk to a worker task owned by its connection. Workers replay requests in
//! capture order: read bytes go to a per-request sequencer, the end-of-message
//! marker settles it, and each chunk is acknowledged back to the gate once its
//! observations have been handled. A chunk holds its connection's context from
//! routing until that acknowledgment, so the context lives as long as any chunk
//! of the connection is queued or in progress. A ticker advances the gate's
//! watermark to the capture time that corresponds to "now".
use ahash::RandomState;
use anyhow::{Context, Result};
use bytes::Bytes;
use hashbrown::HashMap;
use replay_flow::{
    BlockingTrafficSource, BufferedFlowController, BufferedPacketReceiver, ChannelSpan,
    ChunkSource, CompletionSequencer, ConnectionContext, ConnectionContextRegistry,
    ConnectionKey, ConnectionLifecycle, FlowController, FlowError, ObservationKind,
    PacketFinalizingConsumer, SequencerError, SequencerOutcome, TrafficStreamWithKey,
    TransformationStatus,
};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::time_shift::TimeShifter;

/// Hands out one sink per replayed request.
pub trait RequestSinkFactory: Send + Sync + 'static {
    type Output: Clone + Debug + Send + Sync + 'static;
    type Sink: PacketFinalizingConsumer<Output = Self::Output>;

    fn request_sink(&self, key: &ConnectionKey) -> Self::Sink;

    /// Called once per request with its settled outcome.
    fn request_finished(&self, _key: &ConnectionKey, _outcome: &SequencerOutcome<Self::Output>) {}

    /// Called when a captured connection has no more chunks.
    fn connection_closed(&self, _connection_id: &str) {}
}

/// Dry-run target: requests are assembled in memory and dropped.
#[derive(Debug, Default)]
pub struct BufferedSinkFactory;

impl RequestSinkFactory for BufferedSinkFactory {
    type Output = Bytes;
    type Sink = BufferedPacketReceiver;

    fn request_sink(&self, _key: &ConnectionKey) -> BufferedPacketReceiver {
        BufferedPacketReceiver::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub buffer_time_window: Duration,
    pub max_concurrent_cost: u32,
    pub watermark_tick: Duration,
    pub speedup_factor: f64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            buffer_time_window: Duration::from_secs(30),
            max_concurrent_cost: 1024,
            watermark_tick: Duration::from_millis(100),
            speedup_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub chunks_read: u64,
    pub connections: u64,
    pub requests_completed: u64,
    pub requests_incomplete: u64,
    pub requests_without_content: u64,
    pub requests_failed: u64,
    pub response_bytes_skipped: u64,
    pub contract_violations: u64,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct ReplayStats {
    chunks_read: AtomicU64,
    connections: AtomicU64,
    requests_completed: AtomicU64,
    requests_incomplete: AtomicU64,
    requests_without_content: AtomicU64,
    requests_failed: AtomicU64,
    response_bytes_skipped: AtomicU64,
    contract_violations: AtomicU64,
}

impl ReplayStats {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn contract_violation(&self, err: &FlowError) {
        tracing::error!(error = %err, "flow-control contract violated");
        Self::bump(&self.contract_violations, 1);
    }

    fn snapshot(&self, interrupted: bool) -> ReplaySummary {
        ReplaySummary {
            chunks_read: self.chunks_read.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_incomplete: self.requests_incomplete.load(Ordering::Relaxed),
            requests_without_content: self.requests_without_content.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            response_bytes_skipped: self.response_bytes_skipped.load(Ordering::Relaxed),
            contract_violations: self.contract_violations.load(Ordering::Relaxed),
            interrupted,
        }
    }
}

struct InFlightRequest<T> {
    key: ConnectionKey,
    sequencer: CompletionSequencer<T>,
}

struct ReplayShared<F, L> {
    sinks: Arc<F>,
    controller: FlowController,
    registry: ConnectionContextRegistry<L>,
    shifter: TimeShifter,
    stats: ReplayStats,
}

impl<F: RequestSinkFactory, L: ConnectionLifecycle> ReplayShared<F, L> {
    async fn wait_until_scheduled(&self, source_time: SystemTime) {
        let Some(real_time) = self.shifter.transform_source_time_to_real_time(source_time) else {
            return;
        };
        if let Ok(delay) = real_time.duration_since(SystemTime::now())
            && !delay.is_zero()
        {
            tracing::trace!(?delay, "waiting for the request's replay time");
            tokio::time::sleep(delay).await;
        }
    }

    async fn settle(&self, in_flight: InFlightRequest<F::Output>) {
        let outcome = in_flight.sequencer.teardown().wait().await;
        let key = &in_flight.key;
        match &outcome {
            Ok(response) if response.status == TransformationStatus::Completed => {
                ReplayStats::bump(&self.stats.requests_completed, 1);
                tracing::debug!(%key, result = ?response.payload, "request replayed");
            }
            Ok(response) => {
                ReplayStats::bump(&self.stats.requests_incomplete, 1);
                tracing::warn!(%key, result = ?response.payload, "request ended before all of its content was captured");
            }
            Err(SequencerError::NoContent) => {
                ReplayStats::bump(&self.stats.requests_without_content, 1);
                tracing::info!(%key, "request had no content to send");
            }
            Err(err) => {
                ReplayStats::bump(&self.stats.requests_failed, 1);
                tracing::warn!(%key, error = %err, "request replay failed");
            }
        }
        self.sinks.request_finished(key, &outcome);
    }

    // Ack first so the chunk's cost is back in the pool before the context
    // can end.
    fn acknowledge(&self, item: &TrafficStreamWithKey, context: &Arc<ConnectionContext<L>>) {
        if let Err(err) = self.controller.done_processing(item.key()) {
            self.stats.contract_violation(&err);
        }
        if let Err(err) = self.registry.release_context_for(context) {
            self.stats.contract_violation(&err);
        }
    }

    async fn replay_chunk(
        &self,
        item: &TrafficStreamWithKey,
        request: &mut Option<InFlightRequest<F::Output>>,
    ) {
        for observation in item.chunk().observations() {
            match observation.kind() {
                ObservationKind::Read(bytes) => {
                    if request.is_none() {
                        self.wait_until_scheduled(observation.timestamp()).await;
                        let sequencer = CompletionSequencer::spawn(
                            self.sinks.request_sink(item.key()),
                            item.key().to_string(),
                        );
                        *request = Some(InFlightRequest {
                            key: item.key().clone(),
                            sequencer,
                        });
                    }
                    if let Some(in_flight) = request.as_ref()
                        && let Err(err) = in_flight.sequencer.consume_bytes(bytes.clone())
                    {
                        tracing::warn!(key = %in_flight.key, error = %err, "request bytes not accepted");
                    }
                }
                ObservationKind::EndOfMessage => match request.take() {
                    Some(in_flight) => {
                        if let Err(err) = in_flight.sequencer.last_content() {
                            tracing::warn!(key = %in_flight.key, error = %err, "end of message not accepted");
                        }
                        self.settle(in_flight).await;
                    }
                    None => tracing::trace!(key = %item.key(), "end of message with no request bytes"),
                },
                ObservationKind::Write(bytes) => {
                    ReplayStats::bump(&self.stats.response_bytes_skipped, bytes.len() as u64);
                }
                ObservationKind::Close => {
                    if let Some(in_flight) = request.take() {
                        self.settle(in_flight).await;
                    }
                }
            }
        }
    }
}

// A routed chunk and the context reference taken for it.
type Routed<L> = (TrafficStreamWithKey, Arc<ConnectionContext<L>>);

async fn connection_worker<F: RequestSinkFactory, L: ConnectionLifecycle>(
    connection_id: String,
    mut chunks: mpsc::UnboundedReceiver<Routed<L>>,
    shared: Arc<ReplayShared<F, L>>,
) {
    let mut request = None;
    while let Some((item, context)) = chunks.recv().await {
        shared
            .replay_chunk(&item, &mut request)
            .instrument(context.lifecycle().span())
            .await;
        shared.acknowledge(&item, &context);
    }
    if let Some(in_flight) = request.take() {
        tracing::debug!(connection_id = %connection_id, "connection ended mid-request");
        shared.settle(in_flight).await;
    }
    shared.sinks.connection_closed(&connection_id);
}

async fn advance_watermark<F: RequestSinkFactory, L: ConnectionLifecycle>(
    shared: Arc<ReplayShared<F, L>>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        // Before the first chunk anchors replay time, only the first read is let through.
        let replay_time = shared
            .shifter
            .transform_real_time_to_source_time(SystemTime::now())
            .unwrap_or(UNIX_EPOCH);
        shared.controller.stop_reads_past(replay_time);
    }
}

type Routes<L> = HashMap<String, mpsc::UnboundedSender<Routed<L>>, RandomState>;

type LifecycleFactory<L> = dyn Fn(&ConnectionKey) -> L + Send + Sync;

pub struct ReplayDriver<F, L = ChannelSpan> {
    config: DriverConfig,
    sinks: Arc<F>,
    lifecycle: Arc<LifecycleFactory<L>>,
}

impl<F: RequestSinkFactory> ReplayDriver<F> {
    pub fn new(config: DriverConfig, sinks: F) -> Self {
        Self::with_shared_sinks(config, Arc::new(sinks))
    }

    pub fn with_shared_sinks(config: DriverConfig, sinks: Arc<F>) -> Self {
        Self {
            config,
            sinks,
            lifecycle: Arc::new(ChannelSpan::new),
        }
    }
}

impl<F: RequestSinkFactory, L: ConnectionLifecycle> ReplayDriver<F, L> {
    /// Replace the per-connection lifecycle object (a `channel` span by default).
    pub fn with_connection_lifecycle<M: ConnectionLifecycle>(
        self,
        create: impl Fn(&ConnectionKey) -> M + Send + Sync + 'static,
    ) -> ReplayDriver<F, M> {
        ReplayDriver {
            config: self.config,
            sinks: self.sinks,
            lifecycle: Arc::new(create),
        }
    }

    pub fn sinks(&self) -> &Arc<F> {
        &self.sinks
    }

    /// Replays everything `source` yields, or until `shutdown` resolves.
    ///
    /// Each chunk costs 1 and expects one acknowledgment. The run ends when
    /// the source comes back empty with nothing left outstanding.
    pub async fn run<S, Sh>(&self, source: S, shutdown: Sh) -> Result<ReplaySummary>
    where
        S: ChunkSource,
        Sh: Future<Output = ()>,
    {
        let mut gate = BlockingTrafficSource::new(
            source,
            self.config.buffer_time_window,
            self.config.max_concurrent_cost,
            |_| 1,
            |_| 1,
        )
        .context("create flow-control gate")?;
        let lifecycle = Arc::clone(&self.lifecycle);
        let shared = Arc::new(ReplayShared {
            sinks: Arc::clone(&self.sinks),
            controller: gate.controller(),
            registry: ConnectionContextRegistry::with_factory(move |key: &ConnectionKey| lifecycle(key)),
            shifter: TimeShifter::new(self.config.speedup_factor),
            stats: ReplayStats::default(),
        });
        let ticker = tokio::spawn(advance_watermark(
            Arc::clone(&shared),
            self.config.watermark_tick,
        ));
        tracing::info!(
            buffer_time_window = ?self.config.buffer_time_window,
            max_concurrent_cost = self.config.max_concurrent_cost,
            speedup_factor = self.config.speedup_factor,
            "replay started"
        );

        let mut routes: Routes<L> = HashMap::with_hasher(RandomState::new());
        let mut workers = JoinSet::new();
        tokio::pin!(shutdown);
        let read_result = loop {
            let batch = tokio::select! {
                _ = &mut shutdown => break Ok(true),
                batch = gate.read_next_traffic_stream_chunk() => batch,
            };
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => break Err(anyhow::Error::new(err).context("read next chunk")),
            };
            if batch.is_empty() {
                if shared.controller.outstanding().outstanding_count() == 0 {
                    tracing::info!("capture drained");
                    break Ok(false);
                }
                tokio::select! {
                    _ = &mut shutdown => break Ok(true),
                    _ = tokio::time::sleep(self.config.watermark_tick) => continue,
                }
            }
            ReplayStats::bump(&shared.stats.chunks_read, batch.len() as u64);
            if let Some(first) = batch.iter().filter_map(|item| item.chunk().min_timestamp()).min() {
                shared.shifter.set_first_timestamp(first);
            }
            for item in batch {
                dispatch(&mut routes, &mut workers, &shared, item);
            }
        };

        ticker.abort();
        drop(routes);
        let interrupted = !matches!(read_result, Ok(false));
        if interrupted {
            workers.abort_all();
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined
                && !err.is_cancelled()
            {
                tracing::error!(error = %err, "connection worker failed");
            }
        }
        gate.close().context("close capture source")?;

        let interrupted = read_result?;
        if interrupted {
            tracing::info!("replay interrupted by shutdown");
        }
        let summary = shared.stats.snapshot(interrupted);
        tracing::info!(?summary, "replay finished");
        if summary.contract_violations > 0 {
            anyhow::bail!(
                "{} flow-control contract violations during replay",
                summary.contract_violations
            );
        }
        Ok(summary)
    }
}

fn dispatch<F: RequestSinkFactory, L: ConnectionLifecycle>(
    routes: &mut Routes<L>,
    workers: &mut JoinSet<()>,
    shared: &Arc<ReplayShared<F, L>>,
    item: TrafficStreamWithKey,
) {
    let connection_id = item.key().connection_id().to_string();
    let closes = item.chunk().closes_connection();
    let context = shared.registry.retain_or_create_context(item.key());
    let route = routes.entry(connection_id.clone()).or_insert_with(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        ReplayStats::bump(&shared.stats.connections, 1);
        workers.spawn(connection_worker(connection_id.clone(), rx, Arc::clone(shared)));
        tx
    });
    if let Err(mpsc::error::SendError((item, context))) = route.send((item, context)) {
        // The worker is gone; settle the chunk here so its cost is released.
        tracing::error!(key = %item.key(), "connection worker exited early, dropping chunk");
        routes.remove(&connection_id);
        shared.acknowledge(&item, &context);
        return;
    }
    if closes {
        routes.remove(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use replay_flow::{Observation, TrafficChunk};
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedSource {
        batches: VecDeque<Vec<TrafficStreamWithKey>>,
    }

    impl ChunkSource for ScriptedSource {
        fn read_next_chunk(
            &mut self,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<replay_flow::ChunkBatch>> + Send + '_>>
        {
            Box::pin(async move { Ok(self.batches.pop_front().unwrap_or_default()) })
        }

        fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        finished: Mutex<Vec<(ConnectionKey, SequencerOutcome<Bytes>)>>,
        closed: Mutex<Vec<String>>,
    }

    impl RequestSinkFactory for Recording {
        type Output = Bytes;
        type Sink = BufferedPacketReceiver;

        fn request_sink(&self, _key: &ConnectionKey) -> BufferedPacketReceiver {
            BufferedPacketReceiver::new()
        }

        fn request_finished(&self, key: &ConnectionKey, outcome: &SequencerOutcome<Bytes>) {
            self.finished.lock().push((key.clone(), outcome.clone()));
        }

        fn connection_closed(&self, connection_id: &str) {
            self.closed.lock().push(connection_id.to_string());
        }
    }

    fn at_ms(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(1_700_000_000_000 + ms)
    }

    fn chunk(id: &str, index: u32, observations: Vec<Observation>) -> TrafficStreamWithKey {
        TrafficStreamWithKey::new(ConnectionKey::new(id, index), TrafficChunk::new(observations))
    }

    fn fast_config() -> DriverConfig {
        DriverConfig {
            buffer_time_window: Duration::from_secs(1),
            max_concurrent_cost: 4,
            watermark_tick: Duration::from_millis(5),
            speedup_factor: 100.0,
        }
    }

    #[tokio::test]
    async fn requests_split_across_chunks_are_reassembled() -> Result<()> {
        let source = ScriptedSource {
            batches: VecDeque::from(vec![
                vec![chunk("c1", 0, vec![Observation::read(at_ms(0), "POST /idx/_doc ")])],
                vec![chunk(
                    "c1",
                    1,
                    vec![
                        Observation::read(at_ms(1), "HTTP/1.1\r\n\r\n"),
                        Observation::end_of_message(at_ms(1)),
                        Observation::write(at_ms(2), "HTTP/1.1 201 Created\r\n\r\n"),
                        Observation::close(at_ms(3)),
                    ],
                )],
            ]),
        };
        let driver = ReplayDriver::new(fast_config(), Recording::default());
        let summary = driver.run(source, std::future::pending()).await?;

        assert_eq!(summary.chunks_read, 2);
        assert_eq!(summary.connections, 1);
        assert_eq!(summary.requests_completed, 1);
        assert_eq!(summary.response_bytes_skipped, 24);
        assert!(!summary.interrupted);

        let finished = driver.sinks().finished.lock();
        assert_eq!(finished.len(), 1);
        let response = finished[0].1.as_ref().expect("completed");
        assert_eq!(response.payload, Bytes::from_static(b"POST /idx/_doc HTTP/1.1\r\n\r\n"));
        assert_eq!(*driver.sinks().closed.lock(), vec!["c1".to_string()]);
        Ok(())
    }

    struct CountingLifecycle {
        ended: Arc<AtomicUsize>,
    }

    impl ConnectionLifecycle for CountingLifecycle {
        fn end(&self) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn queued_chunks_share_one_connection_context() -> Result<()> {
        // All three chunks arrive in one batch, so they are routed (and retain
        // the context) before the worker acknowledges any of them.
        let source = ScriptedSource {
            batches: VecDeque::from(vec![vec![
                chunk("c4", 0, vec![Observation::read(at_ms(0), "GET /_search ")]),
                chunk(
                    "c4",
                    1,
                    vec![
                        Observation::read(at_ms(1), "HTTP/1.1\r\n\r\n"),
                        Observation::end_of_message(at_ms(1)),
                    ],
                ),
                chunk("c4", 2, vec![Observation::close(at_ms(2))]),
            ]]),
        };
        let created = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));
        let driver = ReplayDriver::new(fast_config(), Recording::default()).with_connection_lifecycle({
            let created = Arc::clone(&created);
            let ended = Arc::clone(&ended);
            move |_key: &ConnectionKey| {
                created.fetch_add(1, Ordering::SeqCst);
                CountingLifecycle {
                    ended: Arc::clone(&ended),
                }
            }
        });

        let summary = driver.run(source, std::future::pending()).await?;
        assert_eq!(summary.chunks_read, 3);
        assert_eq!(summary.requests_completed, 1);
        assert_eq!(summary.contract_violations, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn capture_ending_mid_request_reports_incomplete() -> Result<()> {
        let source = ScriptedSource {
            batches: VecDeque::from(vec![vec![chunk(
                "c2",
                0,
                vec![Observation::read(at_ms(0), "GET /partial")],
            )]]),
        };
        let driver = ReplayDriver::new(fast_config(), Recording::default());
        let summary = driver.run(source, std::future::pending()).await?;
        assert_eq!(summary.requests_incomplete, 1);
        let finished = driver.sinks().finished.lock();
        let response = finished[0].1.as_ref().expect("finalized");
        assert_eq!(response.status, TransformationStatus::Error);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_parked_reader() -> Result<()> {
        // The second chunk sits an hour past the first; nothing after it is
        // inside the read window at captured speed.
        let source = ScriptedSource {
            batches: VecDeque::from(vec![
                vec![chunk("c3", 0, vec![Observation::close(at_ms(0))])],
                vec![chunk("c3", 1, vec![Observation::close(at_ms(3_600_000))])],
                vec![chunk("c3", 2, vec![Observation::close(at_ms(3_600_001))])],
            ]),
        };
        let config = DriverConfig {
            speedup_factor: 1.0,
            ..fast_config()
        };
        let driver = ReplayDriver::new(config, BufferedSinkFactory);
        let summary = driver
            .run(source, tokio::time::sleep(Duration::from_millis(200)))
            .await?;
        assert!(summary.interrupted);
        assert_eq!(summary.chunks_read, 2);
        Ok(())
    }
}
