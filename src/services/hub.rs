//! Hub — the connection registry and fan-out engine.
//!
//! ARCHITECTURE
//! ============
//! The hub owns three cross-indexed maps: every live connection, room id to
//! joined connections, and account id to that account's connections
//! (multi-device). A connection's own room set is the mirror of the room
//! index and is only changed together with it.
//!
//! DESIGN
//! ======
//! - One discipline: all index mutation (register, unregister, join, leave)
//!   takes the single `RwLock` write guard. Fan-out and stats take the read
//!   guard. There is no separate event-queue task, so a broadcast that
//!   snapshots the room after a join returns always includes the joiner.
//! - Empty room and account buckets are removed immediately.
//! - Collaborator calls run outside the lock and are bounded by a timeout.
//!   A failed or timed-out call produces an error for the initiator only and
//!   no fan-out.
//! - Presence is derived: online while the account bucket is non-empty.
//!   The 0→1 and 1→0 transitions drive the presence sink and the
//!   `user_online`/`user_offline` broadcasts. Sink calls for one account
//!   are serialized and skipped when they no longer match the account's
//!   state, so the sink never ends on a stale status.
//!
//! SELF-EXCLUSION
//! ==============
//! Room messages and typing skip exactly the issuing connection; the same
//! account's other connections still receive them. Direct messages reach
//! every connection of both receiver and sender.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_COLLABORATOR_TIMEOUT_SECS, DEFAULT_MAX_CONTENT_CHARS};
use crate::envelope::{
    self, CODE_BAD_REQUEST, CODE_FORBIDDEN, CODE_INTERNAL, DirectMessageRead, Envelope, ErrorCode, Kind, MarkRead,
    NewMessage, ProtocolError, RoomJoined, RoomRef, SendDirectMessage, SendMessage, UserPresence, UserTyping,
};
use crate::services::bridge::{Bridge, Target};
use crate::services::connection::{Connection, ConnectionId, Delivery};
use crate::services::store::{
    Account, ChatStore, Identity, NewDirectMessage, NewRoomMessage, PresenceSink, PresenceStatus, StoreError,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("not a member of room {0}")]
    Forbidden(Uuid),
    #[error("collaborator error: {0}")]
    Store(#[from] StoreError),
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),
}

impl ErrorCode for HubError {
    fn error_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => CODE_BAD_REQUEST,
            Self::Forbidden(_) => CODE_FORBIDDEN,
            Self::Store(_) | Self::Timeout(_) => CODE_INTERNAL,
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Store(_) | Self::Timeout(_) => "internal server error".into(),
            other => other.to_string(),
        }
    }
}

/// External services the hub delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ChatStore>,
    pub identity: Arc<dyn Identity>,
    pub presence: Arc<dyn PresenceSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    pub collaborator_timeout: Duration,
    pub max_content_chars: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            collaborator_timeout: Duration::from_secs(DEFAULT_COLLABORATOR_TIMEOUT_SECS),
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub online_users: usize,
    pub active_rooms: usize,
}

type Bucket = HashMap<ConnectionId, Arc<Connection>>;

#[derive(Default)]
struct Indices {
    connections: Bucket,
    rooms: HashMap<Uuid, Bucket>,
    accounts: HashMap<Uuid, Bucket>,
}

impl Indices {
    fn remove_from(index: &mut HashMap<Uuid, Bucket>, key: Uuid, conn_id: ConnectionId) -> bool {
        let Some(bucket) = index.get_mut(&key) else {
            return false;
        };
        bucket.remove(&conn_id);
        if bucket.is_empty() {
            index.remove(&key);
            return true;
        }
        false
    }
}

struct HubInner {
    indices: RwLock<Indices>,
    collaborators: Collaborators,
    settings: HubSettings,
    bridge: Option<Bridge>,
    /// Per-account lock held across the online check and the presence-sink call.
    presence_gates: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

/// Shared registry handle. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    #[must_use]
    pub fn new(collaborators: Collaborators, settings: HubSettings, bridge: Option<Bridge>) -> Self {
        let inner = HubInner {
            indices: RwLock::new(Indices::default()),
            collaborators,
            settings,
            bridge,
            presence_gates: StdMutex::new(HashMap::new()),
        };
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    /// Run a collaborator call under the configured deadline.
    async fn call<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, HubError> {
        let deadline = self.inner.settings.collaborator_timeout;
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(error = %e, op, "hub: collaborator call failed");
                Err(HubError::Store(e))
            }
            Err(_) => {
                warn!(op, ?deadline, "hub: collaborator call timed out");
                Err(HubError::Timeout(deadline))
            }
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Register a freshly authenticated connection.
    ///
    /// The first connection for an account marks it online. The presence
    /// call and the `user_online` broadcast run on a spawned task so
    /// registration never waits on collaborators.
    pub async fn register(&self, conn: Arc<Connection>) {
        let account_id = conn.account_id();
        let first = {
            let mut idx = self.inner.indices.write().await;
            idx.connections.insert(conn.id(), Arc::clone(&conn));
            let bucket = idx.accounts.entry(account_id).or_default();
            bucket.insert(conn.id(), Arc::clone(&conn));
            bucket.len() == 1
        };

        info!(connection_id = %conn.id(), %account_id, first, "hub: registered");

        if first {
            let hub = self.clone();
            let account = conn.account().clone();
            tokio::spawn(async move {
                hub.announce_presence(&account, PresenceStatus::Online).await;
            });
        }
    }

    /// Remove a connection from every index and close its queue.
    ///
    /// Idempotent: returns `false` and does nothing if the connection is not
    /// registered. When the account's last connection goes away the
    /// presence sink is told (bounded by the collaborator timeout) and
    /// `user_offline` is broadcast.
    pub async fn unregister(&self, conn: &Arc<Connection>) -> bool {
        let account_id = conn.account_id();
        let last = {
            let mut idx = self.inner.indices.write().await;
            if idx.connections.remove(&conn.id()).is_none() {
                return false;
            }
            for room_id in conn.take_rooms() {
                Indices::remove_from(&mut idx.rooms, room_id, conn.id());
            }
            Indices::remove_from(&mut idx.accounts, account_id, conn.id())
        };

        conn.close();
        info!(connection_id = %conn.id(), %account_id, last, "hub: unregistered");

        if last {
            self.announce_presence(conn.account(), PresenceStatus::Offline).await;
        }
        true
    }

    /// Unregister every connection. Called once at process shutdown.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<Connection>> = {
            let idx = self.inner.indices.read().await;
            idx.connections.values().cloned().collect()
        };
        info!(count = conns.len(), "hub: shutting down");
        for conn in &conns {
            self.unregister(conn).await;
        }
    }

    /// Sink calls are serialized, and each one first re-checks that the
    /// account is still in the state being announced. The sink therefore
    /// always ends on the account's current state, whatever order the
    /// online and offline announcements start in.
    async fn announce_presence(&self, account: &Account, status: PresenceStatus) {
        let collab = &self.inner.collaborators;
        let gate = self.presence_gate(account.id);
        let current = {
            let _held = gate.lock().await;
            let current = self.is_online(account.id).await == (status == PresenceStatus::Online);
            if current {
                // Best-effort: failure is logged inside `call`, broadcast still happens.
                let _ = self
                    .call("set_presence", collab.presence.set_presence(account.id, status))
                    .await;
            }
            current
        };
        self.release_presence_gate(account.id, &gate);
        if !current {
            debug!(account_id = %account.id, status = status.as_str(), "hub: stale presence change skipped");
            return;
        }

        let Ok(rooms) = self
            .call("account_rooms", collab.store.account_rooms(account.id))
            .await
        else {
            return;
        };

        let kind = match status {
            PresenceStatus::Online => Kind::UserOnline,
            PresenceStatus::Offline => Kind::UserOffline,
        };
        let env = Envelope::new(kind, UserPresence { user_id: account.id, username: account.username.clone() });
        for room_id in rooms {
            self.fan_out_room(room_id, &env, None).await;
        }
        info!(account_id = %account.id, status = status.as_str(), "hub: presence changed");
    }

    fn presence_gate(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        let mut gates = self
            .inner
            .presence_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(gates.entry(account_id).or_default())
    }

    /// Drop the account's gate once nobody else holds a handle to it.
    fn release_presence_gate(&self, account_id: Uuid, gate: &Arc<Mutex<()>>) {
        let mut gates = self
            .inner
            .presence_gates
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if Arc::strong_count(gate) == 2 {
            gates.remove(&account_id);
        }
    }

    // =========================================================================
    // ROOM MEMBERSHIP
    // =========================================================================

    /// Join a room after the store confirms membership.
    ///
    /// # Errors
    ///
    /// `Forbidden` if the account is not a member; `Store`/`Timeout` if a
    /// collaborator fails. Nothing is indexed on error.
    pub async fn join_room(&self, conn: &Arc<Connection>, room_id: Uuid) -> Result<Envelope, HubError> {
        let store = &self.inner.collaborators.store;
        if !self
            .call("is_member", store.is_member(room_id, conn.account_id()))
            .await?
        {
            return Err(HubError::Forbidden(room_id));
        }
        let summary = self.call("room_summary", store.room_summary(room_id)).await?;

        {
            let mut idx = self.inner.indices.write().await;
            if idx.connections.contains_key(&conn.id()) {
                idx.rooms
                    .entry(room_id)
                    .or_default()
                    .insert(conn.id(), Arc::clone(conn));
                conn.insert_room(room_id);
            }
        }

        info!(connection_id = %conn.id(), %room_id, "hub: joined room");
        Ok(Envelope::new(
            Kind::RoomJoined,
            RoomJoined { room_id, name: summary.name, member_count: summary.member_count },
        ))
    }

    /// Leave a room. Leaving a room never joined is a no-op.
    pub async fn leave_room(&self, conn: &Arc<Connection>, room_id: Uuid) -> Envelope {
        let mut idx = self.inner.indices.write().await;
        if conn.remove_room(room_id) {
            Indices::remove_from(&mut idx.rooms, room_id, conn.id());
            info!(connection_id = %conn.id(), %room_id, "hub: left room");
        }
        drop(idx);
        Envelope::new(Kind::RoomLeft, RoomRef { room_id })
    }

    // =========================================================================
    // MESSAGING
    // =========================================================================

    /// Persist a room message, ack the sender, fan out to the room.
    ///
    /// # Errors
    ///
    /// `Forbidden` if this connection has not joined the room (the store is
    /// never called); `Protocol` for invalid content; `Store`/`Timeout` on
    /// collaborator failure, in which case nothing is broadcast.
    pub async fn route_message(
        &self,
        conn: &Arc<Connection>,
        msg: SendMessage,
        request_id: Option<String>,
    ) -> Result<Envelope, HubError> {
        if !conn.in_room(msg.room_id) {
            return Err(HubError::Forbidden(msg.room_id));
        }
        envelope::validate_content(&msg.content, self.inner.settings.max_content_chars)?;

        let collab = &self.inner.collaborators;
        let profile = self
            .call("profile", collab.identity.profile(conn.account_id()))
            .await?;
        let record = self
            .call(
                "create_room_message",
                collab.store.create_room_message(NewRoomMessage {
                    room_id: msg.room_id,
                    user_id: conn.account_id(),
                    content: msg.content,
                    message_type: msg.message_type,
                    reply_to_id: msg.reply_to_id,
                }),
            )
            .await?;

        let ack = Envelope::ack(request_id, Some(record.id));
        let env = Envelope::new(
            Kind::NewMessage,
            NewMessage {
                id: record.id,
                room_id: record.room_id,
                user_id: record.user_id,
                username: profile.username,
                display_name: profile.display_name,
                avatar_url: profile.avatar_url,
                content: record.content,
                message_type: record.message_type,
                reply_to_id: record.reply_to_id,
                created_at: record.created_at,
            },
        );
        self.fan_out_room(record.room_id, &env, Some(conn.id())).await;
        Ok(ack)
    }

    /// Persist a direct message, ack the sender, deliver to every connection
    /// of the receiver and of the sender.
    ///
    /// # Errors
    ///
    /// `Protocol` for invalid content or a message to oneself;
    /// `Store`/`Timeout` on collaborator failure.
    pub async fn route_direct_message(
        &self,
        conn: &Arc<Connection>,
        msg: SendDirectMessage,
        request_id: Option<String>,
    ) -> Result<Envelope, HubError> {
        let sender_id = conn.account_id();
        if msg.receiver_id == sender_id {
            return Err(ProtocolError::Invalid("cannot send a direct message to yourself".into()).into());
        }
        envelope::validate_content(&msg.content, self.inner.settings.max_content_chars)?;

        let collab = &self.inner.collaborators;
        let profile = self.call("profile", collab.identity.profile(sender_id)).await?;
        let record = self
            .call(
                "create_direct_message",
                collab.store.create_direct_message(NewDirectMessage {
                    sender_id,
                    receiver_id: msg.receiver_id,
                    content: msg.content,
                    message_type: msg.message_type,
                }),
            )
            .await?;

        let ack = Envelope::ack(request_id, Some(record.id));
        let env = Envelope::new(
            Kind::NewDirectMessage,
            envelope::NewDirectMessage {
                id: record.id,
                sender_id: record.sender_id,
                receiver_id: record.receiver_id,
                username: profile.username,
                display_name: profile.display_name,
                avatar_url: profile.avatar_url,
                content: record.content,
                message_type: record.message_type,
                created_at: record.created_at,
            },
        );
        self.fan_out_account(record.receiver_id, &env).await;
        self.fan_out_account(sender_id, &env).await;
        Ok(ack)
    }

    /// Fire-and-forget typing indicator to the room, skipping the issuer.
    /// Ignored when the connection has not joined the room.
    pub async fn broadcast_typing(&self, conn: &Arc<Connection>, room_id: Uuid, typing: bool) {
        if !conn.in_room(room_id) {
            debug!(connection_id = %conn.id(), %room_id, "hub: typing for unjoined room ignored");
            return;
        }
        let kind = if typing { Kind::UserTyping } else { Kind::UserStopTyping };
        let env = Envelope::new(
            kind,
            UserTyping { room_id, user_id: conn.account_id(), username: conn.username().to_string() },
        );
        self.fan_out_room(room_id, &env, Some(conn.id())).await;
    }

    /// Record a read marker for a room or for direct messages from a sender.
    /// Direct-message reads notify the original sender's connections.
    ///
    /// # Errors
    ///
    /// `Protocol` if neither identifier is present; `Forbidden` for a room
    /// this connection has not joined; `Store`/`Timeout` on collaborator
    /// failure.
    pub async fn mark_read(
        &self,
        conn: &Arc<Connection>,
        mark: MarkRead,
        request_id: Option<String>,
    ) -> Result<Envelope, HubError> {
        let store = &self.inner.collaborators.store;
        match (mark.room_id, mark.sender_id) {
            (Some(room_id), _) => {
                if !conn.in_room(room_id) {
                    return Err(HubError::Forbidden(room_id));
                }
                self.call("mark_room_read", store.mark_room_read(room_id, conn.account_id()))
                    .await?;
            }
            (None, Some(sender_id)) => {
                let reader_id = conn.account_id();
                let read_at = self
                    .call("mark_direct_read", store.mark_direct_read(reader_id, sender_id))
                    .await?;
                let env = Envelope::new(Kind::DirectMessageRead, DirectMessageRead { reader_id, sender_id, read_at });
                self.fan_out_account(sender_id, &env).await;
            }
            (None, None) => {
                return Err(ProtocolError::Invalid("room_id or sender_id required".into()).into());
            }
        }
        Ok(Envelope::ack(request_id, None))
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Deliver to the room locally and publish to the bridge.
    pub async fn fan_out_room(&self, room_id: Uuid, env: &Envelope, exclude: Option<ConnectionId>) -> usize {
        let delivered = self.broadcast_room(room_id, env, exclude).await;
        if let Some(bridge) = &self.inner.bridge {
            bridge.publish(Target::Room(room_id), env);
        }
        delivered
    }

    /// Deliver to every connection of an account locally and publish to the bridge.
    pub async fn fan_out_account(&self, account_id: Uuid, env: &Envelope) -> usize {
        let delivered = self.send_to_account(account_id, env).await;
        if let Some(bridge) = &self.inner.bridge {
            bridge.publish(Target::Account(account_id), env);
        }
        delivered
    }

    /// Local-only delivery. Entry point for envelopes arriving from the bridge.
    pub async fn deliver_local(&self, target: Target, env: &Envelope) -> usize {
        match target {
            Target::Room(room_id) => self.broadcast_room(room_id, env, None).await,
            Target::Account(account_id) => self.send_to_account(account_id, env).await,
        }
    }

    /// Enqueue to every local connection in a room, optionally skipping one.
    /// Returns how many queues accepted the envelope.
    pub async fn broadcast_room(&self, room_id: Uuid, env: &Envelope, exclude: Option<ConnectionId>) -> usize {
        let idx = self.inner.indices.read().await;
        let Some(bucket) = idx.rooms.get(&room_id) else {
            return 0;
        };
        enqueue_all(bucket, env, exclude)
    }

    /// Enqueue to every local connection of an account.
    pub async fn send_to_account(&self, account_id: Uuid, env: &Envelope) -> usize {
        let idx = self.inner.indices.read().await;
        let Some(bucket) = idx.accounts.get(&account_id) else {
            return 0;
        };
        enqueue_all(bucket, env, None)
    }

    // =========================================================================
    // STATS
    // =========================================================================

    pub async fn stats(&self) -> HubStats {
        let idx = self.inner.indices.read().await;
        HubStats {
            connections: idx.connections.len(),
            online_users: idx.accounts.len(),
            active_rooms: idx.rooms.len(),
        }
    }

    pub async fn online_accounts(&self) -> Vec<Uuid> {
        let idx = self.inner.indices.read().await;
        idx.accounts.keys().copied().collect()
    }

    pub async fn is_online(&self, account_id: Uuid) -> bool {
        self.inner
            .indices
            .read()
            .await
            .accounts
            .contains_key(&account_id)
    }

    /// Number of local connections joined to a room.
    pub async fn room_size(&self, room_id: Uuid) -> usize {
        self.inner
            .indices
            .read()
            .await
            .rooms
            .get(&room_id)
            .map_or(0, HashMap::len)
    }

    /// Number of local connections for an account.
    pub async fn account_connections(&self, account_id: Uuid) -> usize {
        self.inner
            .indices
            .read()
            .await
            .accounts
            .get(&account_id)
            .map_or(0, HashMap::len)
    }
}

fn enqueue_all(bucket: &Bucket, env: &Envelope, exclude: Option<ConnectionId>) -> usize {
    let mut delivered = 0;
    for (id, conn) in bucket {
        if exclude == Some(*id) {
            continue;
        }
        if conn.enqueue(env.clone()) == Delivery::Queued {
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
