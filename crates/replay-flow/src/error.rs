use crate::key::ConnectionKey;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Failures of the shared gate, tracker and context registry.
///
/// Everything except `Source` and `InterruptedWait` is a broken caller contract:
/// the cost accounting can no longer be trusted once one of them fires.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("wait interrupted: {0}")]
    InterruptedWait(&'static str),
    #[error("max concurrent cost must be between 1 and {max}, got {requested}")]
    InvalidCapacity { requested: u64, max: u64 },
    #[error("batch cost {requested} can never fit under max concurrent cost {capacity}")]
    CostExceedsCapacity { requested: u64, capacity: u32 },
    #[error("outstanding work already registered for {0}")]
    DuplicateRegistration(ConnectionKey),
    #[error("no outstanding work registered for {0}")]
    UnknownOutstandingKey(ConnectionKey),
    #[error("no context registered for connection {0}")]
    UnknownContext(String),
    #[error("context for connection {0} was not issued by this registry entry")]
    ContextMismatch(String),
    #[error("chunk source failed: {0:#}")]
    Source(anyhow::Error),
}

impl FlowError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            FlowError::DuplicateRegistration(_)
                | FlowError::UnknownOutstandingKey(_)
                | FlowError::UnknownContext(_)
                | FlowError::ContextMismatch(_)
        )
    }
}

/// Terminal failure published through a sequencer's completion slot.
///
/// Cloneable so that every read of the slot observes the same value; sink
/// failures keep the original cause behind an `Arc`.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SequencerError {
    #[error("handler removed before any content was consumed")]
    NoContent,
    #[error("downstream sink failed: {0:#}")]
    Sink(Arc<anyhow::Error>),
    #[error("sequencer already torn down")]
    TornDown,
    #[error("sequencer task ended without publishing an outcome")]
    Abandoned,
}

impl SequencerError {
    /// Original cause of a sink failure, if this is one.
    pub fn sink_cause(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            SequencerError::Sink(cause) => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_violations_are_classified() {
        let key = ConnectionKey::new("c1", 0);
        assert!(FlowError::DuplicateRegistration(key.clone()).is_contract_violation());
        assert!(FlowError::UnknownOutstandingKey(key).is_contract_violation());
        assert!(FlowError::ContextMismatch("c1".to_string()).is_contract_violation());
        assert!(!FlowError::InterruptedWait("gate closed").is_contract_violation());
        assert!(!FlowError::Source(anyhow::anyhow!("eof")).is_contract_violation());
    }

    #[test]
    fn flow_error_display_names_the_key() {
        let err = FlowError::UnknownOutstandingKey(ConnectionKey::new("conn-7", 3));
        let text = err.to_string();
        assert!(text.contains("conn-7"));
        assert!(text.contains('3'));
    }

    #[test]
    fn sink_cause_is_shared_not_copied() {
        let cause = Arc::new(anyhow::anyhow!("socket reset"));
        let err = SequencerError::Sink(Arc::clone(&cause));
        let cloned = err.clone();
        assert!(Arc::ptr_eq(cloned.sink_cause().expect("cause"), &cause));
        assert!(SequencerError::NoContent.sink_cause().is_none());
    }
}
