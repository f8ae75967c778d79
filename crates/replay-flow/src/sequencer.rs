// Per-request ordering of sink writes.
//
// Bytes and the end-of-content marker arrive from independent I/O callbacks.
// Each sequencer owns a small task that receives them over an unbounded queue
// and applies them to the sink one at a time, so a write never starts before
// the previous one settled. Teardown settles the chain into exactly one of
// three outcomes and publishes it to a watch slot that every handle can read.
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::error::SequencerError;
use crate::sink::PacketFinalizingConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationStatus {
    /// The end-of-content marker was the last thing applied before teardown.
    Completed,
    /// Content stopped before the end-of-content marker.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedResponse<T> {
    pub payload: T,
    pub status: TransformationStatus,
}

pub type SequencerOutcome<T> = Result<SequencedResponse<T>, SequencerError>;

enum Step {
    Bytes(Bytes),
    LastContent,
    Teardown,
}

enum ChainState {
    Empty,
    Accumulating { all_content_received: bool },
    Failed(Arc<anyhow::Error>),
}

impl ChainState {
    async fn consume<S: PacketFinalizingConsumer>(self, sink: &mut S, bytes: Bytes) -> Self {
        match self {
            ChainState::Failed(cause) => {
                tracing::trace!(len = bytes.len(), "dropping bytes after sink failure");
                ChainState::Failed(cause)
            }
            ChainState::Empty | ChainState::Accumulating { .. } => {
                match sink.consume_bytes(bytes).await {
                    Ok(()) => ChainState::Accumulating {
                        all_content_received: false,
                    },
                    Err(err) => {
                        tracing::debug!(error = %err, "sink rejected bytes");
                        ChainState::Failed(Arc::new(err))
                    }
                }
            }
        }
    }

    fn mark_all_content_received(self) -> Self {
        match self {
            ChainState::Failed(cause) => ChainState::Failed(cause),
            ChainState::Empty | ChainState::Accumulating { .. } => ChainState::Accumulating {
                all_content_received: true,
            },
        }
    }

    async fn settle<S: PacketFinalizingConsumer>(self, sink: &mut S) -> SequencerOutcome<S::Output> {
        match self {
            ChainState::Failed(cause) => Err(SequencerError::Sink(cause)),
            ChainState::Empty => {
                tracing::info!("torn down before any bytes were written");
                Err(SequencerError::NoContent)
            }
            ChainState::Accumulating {
                all_content_received,
            } => {
                let status = if all_content_received {
                    TransformationStatus::Completed
                } else {
                    TransformationStatus::Error
                };
                match sink.finalize_request().await {
                    Ok(payload) => Ok(SequencedResponse { payload, status }),
                    Err(err) => Err(SequencerError::Sink(Arc::new(err))),
                }
            }
        }
    }
}

fn outcome_label<T>(outcome: &SequencerOutcome<T>) -> &'static str {
    match outcome {
        Ok(SequencedResponse {
            status: TransformationStatus::Completed,
            ..
        }) => "completed",
        Ok(SequencedResponse {
            status: TransformationStatus::Error,
            ..
        }) => "incomplete",
        Err(SequencerError::NoContent) => "no_content",
        Err(_) => "failed",
    }
}

async fn run<S>(
    mut sink: S,
    mut steps: mpsc::UnboundedReceiver<Step>,
    slot: watch::Sender<Option<SequencerOutcome<S::Output>>>,
) where
    S: PacketFinalizingConsumer,
    S::Output: Send + Sync,
{
    let mut chain = ChainState::Empty;
    loop {
        match steps.recv().await {
            Some(Step::Bytes(bytes)) => chain = chain.consume(&mut sink, bytes).await,
            Some(Step::LastContent) => chain = chain.mark_all_content_received(),
            Some(Step::Teardown) => break,
            None => {
                tracing::debug!("all sequencer handles dropped, tearing down");
                break;
            }
        }
    }

    steps.close();
    let mut dropped = 0usize;
    while steps.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(dropped, "steps arrived after teardown and were discarded");
    }

    let outcome = chain.settle(&mut sink).await;
    let label = outcome_label(&outcome);
    metrics::counter!("replay_sequencer_outcomes_total", "outcome" => label).increment(1);
    tracing::debug!(outcome = label, "sequencer settled");
    slot.send_replace(Some(outcome));
}

/// Handle used to feed one request's bytes into its sink in order.
///
/// Cloning yields another handle onto the same queue. Steps sent through any
/// handle are applied in the order they were sent. Dropping every handle
/// without calling [`teardown`](Self::teardown) tears the sequencer down.
pub struct CompletionSequencer<T> {
    steps: mpsc::UnboundedSender<Step>,
    torn_down: Arc<AtomicBool>,
    completion: SequencerCompletion<T>,
    label: Arc<str>,
}

impl<T> Clone for CompletionSequencer<T> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
            torn_down: Arc::clone(&self.torn_down),
            completion: self.completion.clone(),
            label: Arc::clone(&self.label),
        }
    }
}

impl<T> std::fmt::Debug for CompletionSequencer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSequencer")
            .field("label", &self.label)
            .field("torn_down", &self.torn_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> CompletionSequencer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Spawns the sequencing task on the current runtime, inside the current span.
    pub fn spawn<S>(sink: S, label: impl Into<Arc<str>>) -> Self
    where
        S: PacketFinalizingConsumer<Output = T>,
    {
        Self::spawn_instrumented(sink, label, tracing::Span::current())
    }

    pub fn spawn_instrumented<S>(sink: S, label: impl Into<Arc<str>>, parent: tracing::Span) -> Self
    where
        S: PacketFinalizingConsumer<Output = T>,
    {
        let label = label.into();
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let (slot_tx, slot_rx) = watch::channel(None);
        let span = tracing::debug_span!(parent: &parent, "sequencer", label = %label);
        tokio::spawn(run(sink, steps_rx, slot_tx).instrument(span));
        Self {
            steps: steps_tx,
            torn_down: Arc::new(AtomicBool::new(false)),
            completion: SequencerCompletion { slot: slot_rx },
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queues bytes for the sink, behind everything queued before them.
    pub fn consume_bytes(&self, bytes: Bytes) -> Result<(), SequencerError> {
        self.send(Step::Bytes(bytes))
    }

    /// Queues the end-of-content marker.
    pub fn last_content(&self) -> Result<(), SequencerError> {
        self.send(Step::LastContent)
    }

    /// Settles the sequencer once everything queued so far has been applied.
    ///
    /// Later calls are no-ops that return the same completion.
    pub fn teardown(&self) -> SequencerCompletion<T> {
        if !self.torn_down.swap(true, Ordering::AcqRel) && self.steps.send(Step::Teardown).is_err() {
            tracing::debug!(label = %self.label, "sequencer task already gone at teardown");
        }
        self.completion.clone()
    }

    fn send(&self, step: Step) -> Result<(), SequencerError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SequencerError::TornDown);
        }
        self.steps.send(step).map_err(|_| SequencerError::TornDown)
    }
}

/// Read side of a sequencer's outcome slot.
///
/// Every read after the slot resolves yields the same value.
pub struct SequencerCompletion<T> {
    slot: watch::Receiver<Option<SequencerOutcome<T>>>,
}

impl<T> Clone for SequencerCompletion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Clone> SequencerCompletion<T> {
    pub async fn wait(&self) -> SequencerOutcome<T> {
        let mut slot = self.slot.clone();
        match slot.wait_for(Option::is_some).await {
            Ok(resolved) => resolved.clone().unwrap_or(Err(SequencerError::Abandoned)),
            Err(_) => Err(SequencerError::Abandoned),
        }
    }

    pub fn try_get(&self) -> Option<SequencerOutcome<T>> {
        self.slot.borrow().clone()
    }
}
