//! Delivery capability for a connected peer.
//!
//! Any task may push records to any user — a dispatcher answering its own
//! client, the relay forwarding on behalf of another user, the call
//! coordinator, a sweeper. [`PeerLink`] is that seam; the TCP-backed
//! implementation serializes writers on a per-connection mutex, which is
//! always the last lock acquired.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::SinkExt;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{CodecError, RecordCipher};
use crate::frame::{FrameError, SentinelCodec};
use crate::records::ServerRecord;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("frame write failed: {0}")]
    Frame(#[from] FrameError),
    #[error("record encode failed: {0}")]
    Codec(#[from] CodecError),
}

/// Capability to push records to one live connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Seals and writes one record through this connection.
    async fn deliver(&self, record: ServerRecord) -> Result<(), LinkError>;

    /// Signals the owning dispatcher to terminate. Idempotent.
    fn close(&self);

    /// Stable identity of the underlying connection.
    fn id(&self) -> Uuid;
}

/// TCP write half of one client connection plus its record cipher.
pub struct ConnectionHandle {
    id: Uuid,
    peer: SocketAddr,
    cipher: RecordCipher,
    writer: Mutex<FramedWrite<OwnedWriteHalf, SentinelCodec>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        peer: SocketAddr,
        cipher: RecordCipher,
        writer: FramedWrite<OwnedWriteHalf, SentinelCodec>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            cipher,
            writer: Mutex::new(writer),
            cancel,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Token the dispatcher selects on; fires when any task closes the link.
    pub fn closed_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PeerLink for ConnectionHandle {
    async fn deliver(&self, record: ServerRecord) -> Result<(), LinkError> {
        if self.cancel.is_cancelled() {
            return Err(LinkError::Closed);
        }
        let frame = self.cipher.seal(&record)?;
        let mut writer = self.writer.lock().await;
        writer.send(frame).await?;
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

/// In-memory link backed by a channel, useful for unit tests.
pub struct ChannelLink {
    id: Uuid,
    tx: mpsc::UnboundedSender<ServerRecord>,
    closed: AtomicBool,
}

impl ChannelLink {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: Uuid::new_v4(),
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for ChannelLink {
    async fn deliver(&self, record: ServerRecord) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.tx.send(record).map_err(|_| LinkError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn id(&self) -> Uuid {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_link_delivers_until_closed() {
        let (link, mut rx) = ChannelLink::pair();
        link.deliver(ServerRecord::HeartbeatAck).await.unwrap();
        assert_eq!(rx.recv().await, Some(ServerRecord::HeartbeatAck));

        link.close();
        assert!(matches!(
            link.deliver(ServerRecord::HeartbeatAck).await,
            Err(LinkError::Closed)
        ));
    }
}
