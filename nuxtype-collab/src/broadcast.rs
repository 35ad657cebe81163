//! Fan-out of session traffic to every connected client but the sender.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! frame is encoded once and tagged with the client it came from; receivers
//! skip their own frames, so an update is never echoed back to its author.
//!
//! Sends happen while the session's state lock is held, which gives every
//! receiver the frames in the order the session applied them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Identifier of one connected client within the process.
pub type ClientId = Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// A pre-encoded frame and the client that caused it.
#[derive(Debug)]
pub struct Envelope {
    /// `None` for frames originating from the server itself
    pub origin: Option<ClientId>,
    pub frame: Vec<u8>,
}

impl Envelope {
    pub fn is_from(&self, client_id: ClientId) -> bool {
        self.origin == Some(client_id)
    }
}

/// A broadcast group for a single document session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,
    /// Channel capacity (messages buffered per receiver)
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// A receiver that falls more than `capacity` frames behind loses the
    /// oldest ones and has to be resynchronised by its connection.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.sender.subscribe()
    }

    /// Encode `msg` once and fan it out. Returns the number of receivers.
    pub fn broadcast(
        &self,
        origin: Option<ClientId>,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(origin, msg.encode()?))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_raw(&self, origin: Option<ClientId>, frame: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Envelope { origin, frame }))
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            receivers: self.receiver_count(),
        }
    }
}
