// Flow control and connection lifecycle for replaying captured traffic.
//
// The gate paces reads from a chunk source against an externally advanced time
// watermark and bounds how much unacknowledged work is in flight. The context
// registry ref-counts per-connection lifecycle objects, and the sequencer turns
// out-of-order I/O callbacks into one ordered, single-resolution outcome per
// request.
pub mod context;
pub mod error;
pub mod gate;
pub mod key;
pub mod outstanding;
pub mod sequencer;
pub mod sink;
pub mod source;

pub use context::{ChannelSpan, ConnectionContext, ConnectionContextRegistry, ConnectionLifecycle};
pub use error::{FlowError, Result, SequencerError};
pub use gate::{BlockingTrafficSource, BufferedFlowController, FlowController};
pub use key::{ConnectionKey, Observation, ObservationKind, TrafficChunk, TrafficStreamWithKey};
pub use outstanding::OutstandingWorkTracker;
pub use sequencer::{
    CompletionSequencer, SequencedResponse, SequencerCompletion, SequencerOutcome,
    TransformationStatus,
};
pub use sink::{BufferedPacketReceiver, PacketFinalizingConsumer};
pub use source::{ChunkBatch, ChunkSource, TrafficCaptureSource};
