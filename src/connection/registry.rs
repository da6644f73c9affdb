//! Connection Registry and Broadcast Engine
//!
//! The registry maps every live connection to its display name and owns the
//! write half of each one. All operations, fan-out writes included, run
//! under one lock, so join, leave and broadcast are totally ordered and no
//! roster frame can reflect a half-applied change.
//!
//! Delivery is best effort. A peer whose write fails is evicted once the
//! whole fan-out pass has finished, so one failing peer never prevents the
//! others from receiving the frame, and the failure is never reported back
//! to the sender. A peer that stalls on a write holds the lock for the
//! duration of that write.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use anyhow::bail;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::protocol::codec;
use crate::Result;

/// Write side of a registered connection
pub type PeerWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identity of an accepted connection, unique for the server's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Resolves once the registry has dropped the connection it was issued for
#[derive(Debug)]
pub struct CloseNotice(oneshot::Receiver<()>);

impl CloseNotice {
    /// Wait until the registry closes this connection.
    ///
    /// Must not be polled again after it has returned.
    pub async fn closed(&mut self) {
        let _ = (&mut self.0).await;
    }
}

/// Outcome of one fan-out pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers that accepted the frame
    pub delivered: usize,
    /// Display names of peers removed because the write failed
    pub evicted: Vec<String>,
}

struct Peer {
    name: String,
    addr: Option<SocketAddr>,
    writer: PeerWriter,
    // Dropping the sender wakes the handler's `CloseNotice`
    _close_tx: oneshot::Sender<()>,
}

impl Peer {
    async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.name, e);
        }
    }
}

/// Synchronized mapping from connection to display name
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: Mutex<HashMap<ConnectionId, Peer>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `name`.
    ///
    /// Fails if `id` is already registered. The returned notice resolves
    /// when the registry drops the connection, either through eviction or
    /// [`close_all`](Self::close_all).
    pub async fn register(
        &self,
        id: ConnectionId,
        name: &str,
        addr: Option<SocketAddr>,
        writer: PeerWriter,
    ) -> Result<CloseNotice> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(&id) {
            bail!("connection {} is already registered", id);
        }

        let (close_tx, close_rx) = oneshot::channel();
        peers.insert(
            id,
            Peer {
                name: name.to_string(),
                addr,
                writer,
                _close_tx: close_tx,
            },
        );
        debug!("Registered {} as '{}' ({} registered)", id, name, peers.len());

        Ok(CloseNotice(close_rx))
    }

    /// Remove a connection, returning the name it was registered under
    pub async fn unregister(&self, id: ConnectionId) -> Option<String> {
        let peer = self.peers.lock().await.remove(&id)?;
        debug!("Unregistered {} ('{}')", id, peer.name);
        Some(peer.name)
    }

    /// Send `[sender] text` to every registered connection
    pub async fn broadcast(&self, sender: &str, text: &str) -> BroadcastReport {
        let frame = codec::encode_chat(sender, text);
        let mut peers = self.peers.lock().await;
        fan_out(&mut peers, &frame).await
    }

    /// Send the current roster to every registered connection
    pub async fn broadcast_roster(&self) -> BroadcastReport {
        let mut peers = self.peers.lock().await;
        let frame = codec::encode_roster(peers.values().map(|peer| peer.name.as_str()));
        fan_out(&mut peers, &frame).await
    }

    /// Snapshot of the registered display names, in no particular order
    pub async fn names(&self) -> Vec<String> {
        self.peers
            .lock()
            .await
            .values()
            .map(|peer| peer.name.clone())
            .collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.peers.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Close every registered connection and clear the registry
    pub async fn close_all(&self) -> usize {
        let mut peers = self.peers.lock().await;
        let closed = peers.len();
        for (id, peer) in peers.drain() {
            debug!("Closing {} ({:?})", id, peer.addr);
            peer.close().await;
        }
        closed
    }
}

async fn fan_out(peers: &mut HashMap<ConnectionId, Peer>, frame: &Bytes) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    let mut failed = Vec::new();

    for (id, peer) in peers.iter_mut() {
        let result = match peer.writer.write_all(frame).await {
            Ok(()) => peer.writer.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!("Error writing to {} ('{}', {:?}): {}", id, peer.name, peer.addr, e);
                failed.push(*id);
            }
        }
    }

    for id in failed {
        if let Some(peer) = peers.remove(&id) {
            report.evicted.push(peer.name.clone());
            peer.close().await;
        }
    }

    report
}
