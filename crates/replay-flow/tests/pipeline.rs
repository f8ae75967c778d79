use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use replay_flow::{
    BlockingTrafficSource, BufferedFlowController, BufferedPacketReceiver, ChunkBatch, ChunkSource,
    CompletionSequencer, ConnectionContextRegistry, ConnectionKey, Observation, ObservationKind,
    SequencerError, TrafficCaptureSource, TrafficChunk, TrafficStreamWithKey, TransformationStatus,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct QueueSource {
    batches: VecDeque<ChunkBatch>,
}

impl ChunkSource for QueueSource {
    fn read_next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChunkBatch>> + Send + '_>> {
        Box::pin(async move { Ok(self.batches.pop_front().unwrap_or_default()) })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn request(id: &str, index: u32, ts: u64, body: &'static str) -> TrafficStreamWithKey {
    TrafficStreamWithKey::new(
        ConnectionKey::new(id, index),
        TrafficChunk::new(vec![
            Observation::read(at(ts), body),
            Observation::end_of_message(at(ts)),
        ]),
    )
}

fn one_signal(_: &TrafficChunk) -> u32 {
    1
}

fn observation_cost(chunk: &TrafficChunk) -> u32 {
    chunk.len() as u32
}

#[tokio::test]
async fn chunks_flow_through_gate_contexts_and_sequencers() {
    let source = QueueSource {
        batches: VecDeque::from(vec![
            vec![request("c1", 0, 10, "GET /a "), request("c2", 0, 11, "GET /b ")],
            vec![request("c1", 1, 12, "GET /c ")],
        ]),
    };
    let mut gate = BlockingTrafficSource::new(
        source,
        Duration::from_secs(30),
        8,
        one_signal,
        observation_cost,
    )
    .expect("gate");
    let controller = gate.controller();
    let registry = Arc::new(ConnectionContextRegistry::new());
    controller.stop_reads_past(at(0));

    let mut completions = Vec::new();
    for _ in 0..2 {
        let batch = timeout(WAIT, gate.read_next_traffic_stream_chunk())
            .await
            .expect("not blocked")
            .expect("read");
        for item in batch {
            let context = registry.retain_or_create_context(item.key());
            let sequencer = CompletionSequencer::spawn_instrumented(
                BufferedPacketReceiver::new(),
                item.key().to_string(),
                context.lifecycle().span(),
            );
            for observation in item.chunk().observations() {
                match observation.kind() {
                    ObservationKind::Read(data) => {
                        sequencer.consume_bytes(data.clone()).expect("bytes");
                    }
                    ObservationKind::EndOfMessage => sequencer.last_content().expect("marker"),
                    _ => {}
                }
            }
            completions.push((item.key().clone(), context, sequencer.teardown()));
        }
    }
    assert_eq!(controller.outstanding().held_cost(), 6);
    assert_eq!(registry.ref_count("c1"), Some(2));

    for (key, context, completion) in completions {
        let response = timeout(WAIT, completion.wait())
            .await
            .expect("settled")
            .expect("response");
        assert_eq!(response.status, TransformationStatus::Completed);
        assert!(response.payload.starts_with(b"GET /"));
        controller.done_processing(&key).expect("ack");
        registry.release_context_for(&context).expect("release");
    }

    assert_eq!(controller.outstanding().held_cost(), 0);
    assert_eq!(controller.outstanding().outstanding_count(), 0);
    assert!(registry.is_empty());
    gate.close().expect("close");
}

#[tokio::test]
async fn exhausted_capacity_parks_the_reader_until_acknowledged() {
    let source = QueueSource {
        batches: VecDeque::from(vec![
            vec![request("c1", 0, 1, "GET /1 ")],
            vec![request("c1", 1, 2, "GET /2 ")],
        ]),
    };
    let mut gate =
        BlockingTrafficSource::new(source, Duration::from_secs(60), 2, one_signal, observation_cost)
            .expect("gate");
    let controller = gate.controller();
    controller.stop_reads_past(at(0));

    gate.read_next_traffic_stream_chunk().await.expect("first");
    assert_eq!(controller.outstanding().available_capacity(), 0);

    let acker = controller.clone();
    let ack = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        acker.done_processing(&ConnectionKey::new("c1", 0))
    });
    let second = timeout(WAIT, gate.read_next_traffic_stream_chunk())
        .await
        .expect("released by ack")
        .expect("second");
    ack.await.expect("join").expect("ack");
    assert_eq!(second[0].key(), &ConnectionKey::new("c1", 1));
    assert_eq!(controller.outstanding().held_cost(), 2);
}

#[tokio::test]
async fn sequencer_without_bytes_reports_no_content() {
    let sequencer = CompletionSequencer::spawn(BufferedPacketReceiver::new(), "idle.0");
    let outcome = timeout(WAIT, sequencer.teardown().wait()).await.expect("settled");
    assert!(matches!(outcome, Err(SequencerError::NoContent)));
    assert!(matches!(
        sequencer.consume_bytes(Bytes::from_static(b"late")),
        Err(SequencerError::TornDown)
    ));
}

#[tokio::test]
async fn gate_is_usable_as_a_trait_object() {
    let source = QueueSource {
        batches: VecDeque::from(vec![vec![request("c9", 0, 5, "GET / ")]]),
    };
    let gate = BlockingTrafficSource::new(source, Duration::ZERO, 4, one_signal, observation_cost)
        .expect("gate");
    let controller: Arc<dyn BufferedFlowController> = Arc::new(gate.controller());
    let mut source: Box<dyn TrafficCaptureSource> = Box::new(gate);

    controller.stop_reads_past(at(5));
    let batch = timeout(WAIT, source.read_next_traffic_stream_chunk())
        .await
        .expect("not blocked")
        .expect("read");
    assert_eq!(batch.len(), 1);
    controller.done_processing(batch[0].key()).expect("ack");
    assert_eq!(controller.buffer_time_window(), Duration::ZERO);
    source.close().expect("close");
}
