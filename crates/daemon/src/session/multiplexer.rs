//! Session output multiplexer.
//!
//! This module fans PTY output out to every registered listener. Listeners are
//! process-wide: each one receives the chunks of every session, tagged with
//! the session id, and decides for itself what to render.
//!
//! Listener channels are unbounded so a slow listener never loses output.
//! Listeners whose receiver has been dropped are pruned on the next broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::sync::RwLock;

use super::pty::SessionId;

/// Unique identifier for a listener registration.
pub type ListenerId = String;

/// One chunk of output from one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub session_id: SessionId,
    pub data: Vec<u8>,
}

/// Statistics about a listener's deliveries.
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    /// Total chunks delivered.
    pub chunks_delivered: u64,
}

struct ListenerHandle {
    tx: mpsc::UnboundedSender<OutputChunk>,
    stats: ListenerStats,
}

/// Broadcasts output chunks to all registered listeners.
#[derive(Clone)]
pub struct OutputBroadcaster {
    /// Map of listener ID to listener handle.
    listeners: Arc<RwLock<HashMap<ListenerId, ListenerHandle>>>,
    /// Last activity timestamp (Unix epoch milliseconds).
    last_activity: Arc<AtomicU64>,
}

impl Default for OutputBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBroadcaster {
    /// Creates a broadcaster with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            last_activity: Arc::new(AtomicU64::new(Self::now_millis())),
        }
    }

    /// Returns the current Unix timestamp in milliseconds.
    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Registers a new listener.
    ///
    /// Returns the listener's id and the receiver its chunks arrive on.
    pub async fn register(&self) -> (ListenerId, mpsc::UnboundedReceiver<OutputChunk>) {
        let listener_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        self.listeners.write().await.insert(
            listener_id.clone(),
            ListenerHandle {
                tx,
                stats: ListenerStats::default(),
            },
        );

        tracing::debug!(listener_id = %listener_id, "Registered output listener");
        (listener_id, rx)
    }

    /// Removes a listener.
    ///
    /// Returns the listener's statistics if it was registered.
    pub async fn unregister(&self, listener_id: &str) -> Option<ListenerStats> {
        let removed = self.listeners.write().await.remove(listener_id);
        if let Some(handle) = &removed {
            tracing::debug!(
                listener_id = %listener_id,
                delivered = handle.stats.chunks_delivered,
                "Unregistered output listener"
            );
        }
        removed.map(|h| h.stats)
    }

    /// Returns the number of registered listeners.
    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Returns statistics for a specific listener.
    pub async fn listener_stats(&self, listener_id: &str) -> Option<ListenerStats> {
        self.listeners
            .read()
            .await
            .get(listener_id)
            .map(|h| h.stats.clone())
    }

    /// Returns the last activity timestamp in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Sends a chunk to every listener.
    ///
    /// Returns the number of listeners that received it.
    pub async fn broadcast(&self, session_id: &SessionId, data: Vec<u8>) -> usize {
        self.last_activity
            .store(Self::now_millis(), Ordering::Relaxed);

        let mut listeners = self.listeners.write().await;
        let mut closed = Vec::new();
        let mut delivered = 0;

        for (listener_id, handle) in listeners.iter_mut() {
            let chunk = OutputChunk {
                session_id: session_id.clone(),
                data: data.clone(),
            };
            if handle.tx.send(chunk).is_ok() {
                handle.stats.chunks_delivered += 1;
                delivered += 1;
            } else {
                closed.push(listener_id.clone());
            }
        }

        for listener_id in closed {
            listeners.remove(&listener_id);
            tracing::debug!(listener_id = %listener_id, "Pruned closed output listener");
        }

        delivered
    }
}
