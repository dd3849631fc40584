//! Connection — one authenticated socket as seen by the hub.
//!
//! DESIGN
//! ======
//! A connection owns a bounded outbound queue and the set of rooms it has
//! joined. The room set has its own lock so "am I in this room" never
//! contends with hub-wide traffic. The hub owns the reverse index; both are
//! only mutated together while the hub's write lock is held.
//!
//! BACKPRESSURE
//! ============
//! `enqueue` never blocks. When the queue is full the incoming envelope is
//! dropped and the drop is logged; envelopes already queued are kept, so a
//! slow reader observes gaps rather than reordering.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::services::store::Account;

pub type ConnectionId = Uuid;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue full; envelope discarded.
    Dropped,
    /// Connection already torn down.
    Closed,
}

pub struct Connection {
    id: ConnectionId,
    account: Account,
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    rooms: Mutex<HashSet<Uuid>>,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue.
    #[must_use]
    pub fn new(account: Account, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            account,
            outbound: Mutex::new(Some(tx)),
            rooms: Mutex::new(HashSet::new()),
        };
        (Arc::new(conn), rx)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    #[must_use]
    pub fn account_id(&self) -> Uuid {
        self.account.id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.account.username
    }

    // =========================================================================
    // OUTBOUND QUEUE
    // =========================================================================

    /// Queue an envelope for the write task without blocking.
    pub fn enqueue(&self, envelope: Envelope) -> Delivery {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbound.as_ref() else {
            return Delivery::Closed;
        };
        match tx.try_send(envelope) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    connection_id = %self.id,
                    account_id = %self.account.id,
                    kind = ?dropped.kind,
                    "ws: outbound queue full, dropping envelope"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Number of envelopes waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        outbound
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    /// Close the outbound queue so the write task drains and exits.
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    // =========================================================================
    // ROOM SET
    // =========================================================================

    #[must_use]
    pub fn in_room(&self, room_id: Uuid) -> bool {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&room_id)
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<Uuid> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Only called by the hub while it holds its index write lock.
    pub(crate) fn insert_room(&self, room_id: Uuid) -> bool {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id)
    }

    /// Only called by the hub while it holds its index write lock.
    pub(crate) fn remove_room(&self, room_id: Uuid) -> bool {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&room_id)
    }

    /// Only called by the hub while it holds its index write lock.
    pub(crate) fn take_rooms(&self) -> HashSet<Uuid> {
        std::mem::take(&mut *self.rooms.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("account_id", &self.account.id)
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
