// Decoded traffic chunks and the keys that identify them.
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// One ordered chunk of traffic within a connection.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionKey {
    connection_id: String,
    stream_index: u32,
}

impl ConnectionKey {
    pub fn new(connection_id: impl Into<String>, stream_index: u32) -> Self {
        Self {
            connection_id: connection_id.into(),
            stream_index,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn stream_index(&self) -> u32 {
        self.stream_index
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.connection_id, self.stream_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationKind {
    // Bytes the client sent; these are what gets replayed.
    Read(Bytes),
    // Bytes the original server answered with.
    Write(Bytes),
    // The current request has been fully captured.
    EndOfMessage,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    timestamp: SystemTime,
    kind: ObservationKind,
}

impl Observation {
    pub fn new(timestamp: SystemTime, kind: ObservationKind) -> Self {
        Self { timestamp, kind }
    }

    pub fn read(timestamp: SystemTime, data: impl Into<Bytes>) -> Self {
        Self::new(timestamp, ObservationKind::Read(data.into()))
    }

    pub fn write(timestamp: SystemTime, data: impl Into<Bytes>) -> Self {
        Self::new(timestamp, ObservationKind::Write(data.into()))
    }

    pub fn end_of_message(timestamp: SystemTime) -> Self {
        Self::new(timestamp, ObservationKind::EndOfMessage)
    }

    pub fn close(timestamp: SystemTime) -> Self {
        Self::new(timestamp, ObservationKind::Close)
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn kind(&self) -> &ObservationKind {
        &self.kind
    }
}

/// Immutable, timestamp-ordered observations for one [`ConnectionKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficChunk {
    observations: Vec<Observation>,
}

impl TrafficChunk {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn max_timestamp(&self) -> Option<SystemTime> {
        self.observations.iter().map(Observation::timestamp).max()
    }

    pub fn min_timestamp(&self) -> Option<SystemTime> {
        self.observations.iter().map(Observation::timestamp).min()
    }

    pub fn closes_connection(&self) -> bool {
        self.observations
            .iter()
            .any(|observation| matches!(observation.kind, ObservationKind::Close))
    }
}

/// A chunk paired with its key, as handed out by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficStreamWithKey {
    key: ConnectionKey,
    chunk: Arc<TrafficChunk>,
}

impl TrafficStreamWithKey {
    pub fn new(key: ConnectionKey, chunk: TrafficChunk) -> Self {
        Self {
            key,
            chunk: Arc::new(chunk),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn chunk(&self) -> &TrafficChunk {
        &self.chunk
    }
}
