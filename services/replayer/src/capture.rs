//! JSON-lines capture files.
//!
//! One chunk per line:
//!
//! ```text
//! {"connection_id":"c1","index":0,"observations":[{"ts_ms":1700000000000,"kind":"read","data":"R0VUIC8="}]}
//! ```
//!
//! `data` is base64 and present only on `read` and `write` observations.
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use replay_flow::{
    ChunkBatch, ChunkSource, ConnectionKey, Observation, ObservationKind, TrafficChunk,
    TrafficStreamWithKey,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturedKind {
    Read,
    Write,
    EndOfMessage,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedObservation {
    pub ts_ms: u64,
    pub kind: CapturedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedChunkRecord {
    pub connection_id: String,
    pub index: u32,
    pub observations: Vec<CapturedObservation>,
}

fn millis_since_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl CapturedObservation {
    fn decode(&self) -> Result<Observation> {
        let timestamp = UNIX_EPOCH + Duration::from_millis(self.ts_ms);
        let payload = |data: &Option<String>| -> Result<Vec<u8>> {
            let encoded = data.as_deref().context("read/write observation without data")?;
            STANDARD.decode(encoded).context("observation data is not valid base64")
        };
        Ok(match self.kind {
            CapturedKind::Read => Observation::read(timestamp, payload(&self.data)?),
            CapturedKind::Write => Observation::write(timestamp, payload(&self.data)?),
            CapturedKind::EndOfMessage => Observation::end_of_message(timestamp),
            CapturedKind::Close => Observation::close(timestamp),
        })
    }

    fn encode(observation: &Observation) -> Self {
        let ts_ms = millis_since_epoch(observation.timestamp());
        let (kind, data) = match observation.kind() {
            ObservationKind::Read(bytes) => (CapturedKind::Read, Some(STANDARD.encode(bytes))),
            ObservationKind::Write(bytes) => (CapturedKind::Write, Some(STANDARD.encode(bytes))),
            ObservationKind::EndOfMessage => (CapturedKind::EndOfMessage, None),
            ObservationKind::Close => (CapturedKind::Close, None),
        };
        Self { ts_ms, kind, data }
    }
}

impl CapturedChunkRecord {
    pub fn from_stream(stream: &TrafficStreamWithKey) -> Self {
        Self {
            connection_id: stream.key().connection_id().to_string(),
            index: stream.key().stream_index(),
            observations: stream
                .chunk()
                .observations()
                .iter()
                .map(CapturedObservation::encode)
                .collect(),
        }
    }

    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).context("encode capture record")
    }
}

impl TryFrom<CapturedChunkRecord> for TrafficStreamWithKey {
    type Error = anyhow::Error;

    fn try_from(record: CapturedChunkRecord) -> Result<Self> {
        if record.observations.is_empty() {
            bail!(
                "chunk {}.{} has no observations",
                record.connection_id,
                record.index
            );
        }
        let observations = record
            .observations
            .iter()
            .map(CapturedObservation::decode)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("decode chunk {}.{}", record.connection_id, record.index))?;
        Ok(TrafficStreamWithKey::new(
            ConnectionKey::new(record.connection_id, record.index),
            TrafficChunk::new(observations),
        ))
    }
}

/// Reads a capture file in fixed-size batches.
///
/// Blank lines are skipped. End of file yields empty batches from then on.
pub struct CaptureFileSource {
    path: PathBuf,
    lines: Option<Lines<BufReader<File>>>,
    batch_size: usize,
    line_number: usize,
}

impl CaptureFileSource {
    pub async fn open(path: impl AsRef<Path>, batch_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .with_context(|| format!("open capture file {}", path.display()))?;
        tracing::info!(path = %path.display(), batch_size, "opened capture file");
        Ok(Self {
            path,
            lines: Some(BufReader::new(file).lines()),
            batch_size: batch_size.max(1),
            line_number: 0,
        })
    }

    async fn next_batch(&mut self) -> Result<ChunkBatch> {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(lines) = self.lines.as_mut() else {
                break;
            };
            let Some(line) = lines
                .next_line()
                .await
                .with_context(|| format!("read {}", self.path.display()))?
            else {
                tracing::debug!(path = %self.path.display(), lines = self.line_number, "end of capture");
                self.lines = None;
                break;
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let record: CapturedChunkRecord = serde_json::from_str(&line).with_context(|| {
                format!("parse {} line {}", self.path.display(), self.line_number)
            })?;
            batch.push(TrafficStreamWithKey::try_from(record)?);
        }
        Ok(batch)
    }
}

impl ChunkSource for CaptureFileSource {
    fn read_next_chunk(&mut self) -> Pin<Box<dyn Future<Output = Result<ChunkBatch>> + Send + '_>> {
        Box::pin(self.next_batch())
    }

    fn close(&mut self) -> Result<()> {
        if self.lines.take().is_some() {
            tracing::debug!(path = %self.path.display(), "capture file closed before end");
        }
        Ok(())
    }
}
