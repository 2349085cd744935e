//! Subscriber registry and broadcast fan-out.
//!
//! Each subscriber owns an unbounded channel of pre-serialized text frames;
//! broadcast serializes once upstream and fans the same string out to every
//! subscriber, removing any whose channel has gone away. The snapshot frame a
//! subscriber receives on connect is enqueued into its own channel before the
//! subscriber becomes visible to broadcasts, so per-subscriber FIFO makes the
//! snapshot precede everything else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::model::frames;

/// Keepalive cadence for subscriber sockets.
const PING_INTERVAL: Duration = Duration::from_secs(60);

pub struct ConnectionHub {
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
    next_id: AtomicU64,
    total_connections: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber, optionally enqueueing a snapshot frame that is
    /// guaranteed to be delivered before any subsequent broadcast.
    pub fn register(&self, snapshot: Option<String>) -> (u64, mpsc::UnboundedReceiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(frame) = snapshot {
            let _ = tx.send(frame);
        }
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        clients.insert(id, tx);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("subscriber {id} registered ({} active)", clients.len());
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        if clients.remove(&id).is_some() {
            log::info!("subscriber {id} removed ({} active)", clients.len());
        }
    }

    /// Fans one pre-serialized frame out to every subscriber. A failed send
    /// means the receiving task is gone; that subscriber is dropped silently.
    pub fn broadcast(&self, frame: &str) {
        let mut clients = self.clients.lock().expect("hub lock poisoned");
        clients.retain(|id, tx| match tx.send(frame.to_string()) {
            Ok(()) => true,
            Err(_) => {
                log::info!("subscriber {id} disconnected during broadcast");
                false
            }
        });
    }

    pub fn size(&self) -> usize {
        self.clients.lock().expect("hub lock poisoned").len()
    }

    /// Monotonic count of every subscriber ever registered.
    pub fn total_connection_count(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Emits `{"type":"ping","ts"}` to all subscribers every 60 seconds.
pub fn start_pings(
    hub: Arc<ConnectionHub>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so pings start one
        // interval after boot.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    hub.broadcast(&frames::ping(Utc::now().timestamp_millis()));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_precedes_broadcast() {
        let hub = ConnectionHub::new();
        let (_s1, mut rx1) = hub.register(None);
        let (_s3, mut rx3) = hub.register(Some("snapshot".to_string()));

        hub.broadcast("signed");

        assert_eq!(rx3.try_recv().unwrap(), "snapshot");
        assert_eq!(rx3.try_recv().unwrap(), "signed");
        // The earlier subscriber never saw the snapshot.
        assert_eq!(rx1.try_recv().unwrap(), "signed");
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn dead_subscribers_are_pruned_on_broadcast() {
        let hub = ConnectionHub::new();
        let (_a, rx_a) = hub.register(None);
        let (_b, mut rx_b) = hub.register(None);
        assert_eq!(hub.size(), 2);

        drop(rx_a);
        hub.broadcast("frame");
        assert_eq!(hub.size(), 1);
        assert_eq!(rx_b.try_recv().unwrap(), "frame");
    }

    #[test]
    fn totals_are_monotonic() {
        let hub = ConnectionHub::new();
        let (a, _rx_a) = hub.register(None);
        let (_b, _rx_b) = hub.register(None);
        hub.unregister(a);
        assert_eq!(hub.size(), 1);
        assert_eq!(hub.total_connection_count(), 2);
    }
}
