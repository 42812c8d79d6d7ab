use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rover_protocol::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Per-peer outbound queue depth. Commands beyond this are dropped for that
/// peer only.
pub const PEER_QUEUE_DEPTH: usize = 32;

pub type PeerId = u64;

/// Reacts to the relay's peer count crossing zero.
pub trait PeerLifecycle: Send + Sync {
    /// Peer count went from 0 to 1.
    fn first_peer_joined(&self);
    /// Peer count dropped to 0.
    fn last_peer_left(&self);
    /// Whether whatever the lifecycle drives is currently active.
    fn is_running(&self) -> bool;
}

/// Active peer set for the one shared relay endpoint.
pub struct RelayHub {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<Command>>>,
    count: Arc<AtomicUsize>,
    next_id: AtomicU64,
    lifecycle: Arc<dyn PeerLifecycle>,
}

impl RelayHub {
    /// `count` mirrors the peer set size for readers outside the hub.
    pub fn new(lifecycle: Arc<dyn PeerLifecycle>, count: Arc<AtomicUsize>) -> Self {
        count.store(0, Ordering::SeqCst);
        Self {
            peers: Mutex::new(HashMap::new()),
            count,
            next_id: AtomicU64::new(1),
            lifecycle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::Sender<Command>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a peer. Returns its id and the queue of commands relayed to it.
    ///
    /// The count update and the 0→1 signal happen under the set lock, so
    /// threshold crossings reach the lifecycle in order.
    pub fn join(&self) -> (PeerId, mpsc::Receiver<Command>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);

        let mut peers = self.lock();
        peers.insert(id, tx);
        self.count.store(peers.len(), Ordering::SeqCst);
        info!(peer = id, peers = peers.len(), "relay peer connected");
        if peers.len() == 1 {
            self.lifecycle.first_peer_joined();
        }
        (id, rx)
    }

    /// Remove a peer. Unknown ids are ignored, so double removal is harmless.
    pub fn leave(&self, id: PeerId) {
        let mut peers = self.lock();
        if peers.remove(&id).is_none() {
            return;
        }
        self.count.store(peers.len(), Ordering::SeqCst);
        info!(peer = id, peers = peers.len(), "relay peer disconnected");
        if peers.is_empty() {
            self.lifecycle.last_peer_left();
        }
    }

    /// Queue `cmd` for every active peer except `from`. Best effort: a peer
    /// whose queue is full or closed misses it. Returns how many peers got it.
    pub fn relay(&self, from: PeerId, cmd: Command) -> usize {
        let peers = self.lock();
        let mut delivered = 0;
        for (id, tx) in peers.iter().filter(|(id, _)| **id != from) {
            match tx.try_send(cmd) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = *id, error = %e, "relay to peer dropped"),
            }
        }
        delivered
    }

    pub fn peer_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> &Arc<dyn PeerLifecycle> {
        &self.lifecycle
    }
}
