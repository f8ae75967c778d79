// Sends replayed requests to the target over one TCP stream per captured
// connection. The stream is opened by the first write of the connection and
// shared by every request sink handed out for it; requests of one connection
// are replayed one after another, so writes never interleave. Responses are
// drained by a task per stream so the target never stalls on a full socket,
// and connects and writes are bounded by the write timeout.
use ahash::RandomState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use replay_flow::{ConnectionKey, PacketFinalizingConsumer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use crate::driver::RequestSinkFactory;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct TargetConnection {
    writer: OwnedWriteHalf,
    drain: JoinHandle<()>,
}

impl Drop for TargetConnection {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

type SharedConnection = Arc<tokio::sync::Mutex<Option<TargetConnection>>>;

async fn drain_responses(mut reader: OwnedReadHalf, target: SocketAddr, received: Arc<AtomicU64>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(target_addr = %target, "target closed connection");
                break;
            }
            Ok(n) => {
                received.fetch_add(n as u64, Ordering::Relaxed);
                metrics::counter!("replay_response_bytes_total").increment(n as u64);
            }
            Err(err) => {
                tracing::debug!(target_addr = %target, error = %err, "reading target responses failed");
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct TcpSinkFactory {
    target: SocketAddr,
    write_timeout: Duration,
    connections: Mutex<HashMap<String, SharedConnection, RandomState>>,
    response_bytes: Arc<AtomicU64>,
}

impl TcpSinkFactory {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            connections: Mutex::new(HashMap::with_hasher(RandomState::new())),
            response_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn open_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Response bytes read back from the target so far.
    pub fn response_bytes(&self) -> u64 {
        self.response_bytes.load(Ordering::Relaxed)
    }
}

impl RequestSinkFactory for TcpSinkFactory {
    type Sink = TcpRequestSink;
    type Output = u64;

    fn request_sink(&self, key: &ConnectionKey) -> TcpRequestSink {
        let connection = Arc::clone(
            self.connections
                .lock()
                .entry(key.connection_id().to_string())
                .or_default(),
        );
        TcpRequestSink {
            target: self.target,
            write_timeout: self.write_timeout,
            connection,
            response_bytes: Arc::clone(&self.response_bytes),
            bytes_sent: 0,
        }
    }

    fn connection_closed(&self, connection_id: &str) {
        if self.connections.lock().remove(connection_id).is_some() {
            tracing::debug!(connection_id, "released target connection");
        }
    }
}

/// Writes one request; finalizing flushes and reports the bytes written.
#[derive(Debug)]
pub struct TcpRequestSink {
    target: SocketAddr,
    write_timeout: Duration,
    connection: SharedConnection,
    response_bytes: Arc<AtomicU64>,
    bytes_sent: u64,
}

impl TcpRequestSink {
    async fn connect(&self) -> Result<TargetConnection> {
        let stream = tokio::time::timeout(self.write_timeout, TcpStream::connect(self.target))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {} timed out after {:?}", self.target, self.write_timeout))?
            .with_context(|| format!("connect to {}", self.target))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        tracing::debug!(target_addr = %self.target, "opened target connection");
        let (reader, writer) = stream.into_split();
        let drain = tokio::spawn(drain_responses(
            reader,
            self.target,
            Arc::clone(&self.response_bytes),
        ));
        Ok(TargetConnection { writer, drain })
    }
}

#[async_trait]
impl PacketFinalizingConsumer for TcpRequestSink {
    type Output = u64;

    async fn consume_bytes(&mut self, bytes: Bytes) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(connection) = guard.as_mut() else {
            anyhow::bail!("target connection unavailable");
        };
        let written = tokio::time::timeout(self.write_timeout, connection.writer.write_all(&bytes)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // A broken stream is reopened by the next request.
                *guard = None;
                return Err(err).with_context(|| format!("write {} bytes to {}", bytes.len(), self.target));
            }
            Err(_) => {
                *guard = None;
                anyhow::bail!(
                    "write {} bytes to {} timed out after {:?}",
                    bytes.len(),
                    self.target,
                    self.write_timeout
                );
            }
        }
        self.bytes_sent += bytes.len() as u64;
        metrics::counter!("replay_bytes_sent_total").increment(bytes.len() as u64);
        Ok(())
    }

    async fn finalize_request(&mut self) -> Result<u64> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_mut() {
            match tokio::time::timeout(self.write_timeout, connection.writer.flush()).await {
                Ok(flushed) => flushed.context("flush target connection")?,
                Err(_) => {
                    *guard = None;
                    anyhow::bail!("flush to {} timed out after {:?}", self.target, self.write_timeout);
                }
            }
        }
        Ok(self.bytes_sent)
    }
}
