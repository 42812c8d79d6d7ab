use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast;

/// Fan-out of transcoder output to every open viewer.
///
/// All viewers share one bounded ring. A viewer that falls behind loses the
/// oldest chunks instead of growing a private backlog.
pub struct ChunkBroadcast {
    pub sender: broadcast::Sender<Bytes>,
    pub viewer_count: Arc<AtomicUsize>,
    pub chunks_broadcast: AtomicU64,
    pub viewer_lag_total: AtomicU64,
}

impl ChunkBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            viewer_count: Arc::new(AtomicUsize::new(0)),
            chunks_broadcast: AtomicU64::new(0),
            viewer_lag_total: AtomicU64::new(0),
        }
    }

    /// Subscribe a new viewer. Returns a receiver and a guard that decrements
    /// the viewer count on drop.
    pub fn subscribe(&self) -> (broadcast::Receiver<Bytes>, ViewerGuard) {
        self.viewer_count.fetch_add(1, Ordering::Relaxed);
        let rx = self.sender.subscribe();
        let guard = ViewerGuard {
            count: Arc::clone(&self.viewer_count),
        };
        (rx, guard)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::Relaxed)
    }

    /// Send a chunk to all viewers. Returns the number of receivers reached;
    /// zero viewers is not an error.
    pub fn send_chunk(&self, chunk: Bytes) -> usize {
        self.chunks_broadcast.fetch_add(1, Ordering::Relaxed);
        self.sender.send(chunk).unwrap_or(0)
    }

    /// Account chunks a lagging viewer skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.viewer_lag_total.fetch_add(skipped, Ordering::Relaxed);
    }
}

/// RAII guard that decrements the viewer count when dropped.
pub struct ViewerGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn test_guard_tracks_open_viewers() {
        let bc = ChunkBroadcast::new(8);
        let viewers: Vec<_> = (0..3).map(|_| bc.subscribe()).collect();
        assert_eq!(bc.viewer_count(), 3);

        // A viewer whose socket closed drops its receiver and guard together.
        drop(viewers);
        assert_eq!(bc.viewer_count(), 0);
        assert_eq!(bc.send_chunk(Bytes::from_static(b"late")), 0);
    }

    #[test]
    fn test_lag_accumulates_across_viewers() {
        let bc = ChunkBroadcast::new(4);
        bc.record_lag(3);
        bc.record_lag(5);
        assert_eq!(bc.viewer_lag_total.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_chunk_reaches_every_viewer() {
        let bc = ChunkBroadcast::new(16);
        let (mut rx1, _g1) = bc.subscribe();
        let (mut rx2, _g2) = bc.subscribe();

        assert_eq!(bc.send_chunk(Bytes::from_static(b"\x47\x40")), 2);

        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"\x47\x40"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"\x47\x40"));
    }

    #[test]
    fn test_send_without_viewers() {
        let bc = ChunkBroadcast::new(4);
        assert_eq!(bc.send_chunk(Bytes::from_static(b"x")), 0);
        assert_eq!(bc.chunks_broadcast.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_slow_viewer_drops_oldest() {
        let bc = ChunkBroadcast::new(2);
        let (mut slow, _g) = bc.subscribe();
        for i in 0..5u8 {
            bc.send_chunk(Bytes::from(vec![i]));
        }

        match slow.recv().await {
            Err(RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        // Only the newest chunks survive.
        assert_eq!(slow.recv().await.unwrap(), Bytes::from(vec![3]));
        assert_eq!(slow.recv().await.unwrap(), Bytes::from(vec![4]));
    }
}
