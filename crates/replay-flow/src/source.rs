// ChunkSource abstracts "read the next batch" so the gate can be driven by a
// capture file, a broker consumer, or a scripted queue in tests.
use crate::error::Result;
use crate::key::TrafficStreamWithKey;
use std::future::Future;
use std::pin::Pin;

pub type ChunkBatch = Vec<TrafficStreamWithKey>;

/// Upstream producer of decoded traffic chunks.
///
/// An empty batch means nothing is currently available; sources that reach a
/// definite end keep returning empty batches.
pub trait ChunkSource: Send {
    fn read_next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChunkBatch>> + Send + '_>>;

    fn close(&mut self) -> anyhow::Result<()>;
}

/// What the replayer reads from: a paced, capacity-bounded chunk source.
///
/// Reads are not cancel safe: a read dropped after the underlying source
/// returned a batch discards that batch.
pub trait TrafficCaptureSource: Send {
    fn read_next_traffic_stream_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkBatch>> + Send + '_>>;

    fn close(&mut self) -> Result<()>;
}

// Test helper: deterministic source backed by a queue of batches.
#[cfg(test)]
pub(crate) struct TestChunkSource {
    pub(crate) batches: std::collections::VecDeque<anyhow::Result<ChunkBatch>>,
    pub(crate) reads: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    pub(crate) closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl TestChunkSource {
    pub(crate) fn new(batches: Vec<anyhow::Result<ChunkBatch>>) -> Self {
        Self {
            batches: batches.into(),
            reads: Default::default(),
            closed: Default::default(),
        }
    }
}

#[cfg(test)]
impl ChunkSource for TestChunkSource {
    fn read_next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChunkBatch>> + Send + '_>> {
        Box::pin(async move {
            self.reads
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.batches.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        })
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
