use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

/// Downstream consumer of one request's bytes.
///
/// `consume_bytes` is called in arrival order, each call only after the
/// previous one resolved. `finalize_request` is called at most once, after the
/// last successful `consume_bytes`.
#[async_trait]
pub trait PacketFinalizingConsumer: Send + 'static {
    type Output: Send + 'static;

    async fn consume_bytes(&mut self, bytes: Bytes) -> anyhow::Result<()>;

    async fn finalize_request(&mut self) -> anyhow::Result<Self::Output>;
}

/// Collects request bytes in memory; finalizing yields everything consumed.
#[derive(Debug, Default)]
pub struct BufferedPacketReceiver {
    packets: Vec<Bytes>,
}

impl BufferedPacketReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }
}

#[async_trait]
impl PacketFinalizingConsumer for BufferedPacketReceiver {
    type Output = Bytes;

    async fn consume_bytes(&mut self, bytes: Bytes) -> anyhow::Result<()> {
        self.packets.push(bytes);
        Ok(())
    }

    async fn finalize_request(&mut self) -> anyhow::Result<Bytes> {
        let len = self.packets.iter().map(Bytes::len).sum();
        let mut assembled = BytesMut::with_capacity(len);
        for packet in &self.packets {
            assembled.extend_from_slice(packet);
        }
        Ok(assembled.freeze())
    }
}
