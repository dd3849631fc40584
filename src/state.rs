//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! carries the explicitly constructed hub (no global singleton), the
//! identity collaborator used to authenticate upgrades and admin calls, and
//! the per-connection transport limits.

use std::sync::Arc;

use crate::config::ConnectionLimits;
use crate::services::hub::Hub;
use crate::services::store::Identity;

/// Clone is required by Axum; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub identity: Arc<dyn Identity>,
    pub limits: ConnectionLimits,
}

impl AppState {
    #[must_use]
    pub fn new(hub: Hub, limits: ConnectionLimits) -> Self {
        let identity = Arc::clone(&hub.collaborators().identity);
        Self { hub, identity, limits }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    use super::*;
    use crate::envelope::{Envelope, Kind};
    use crate::services::connection::Connection;
    use crate::services::hub::{Collaborators, HubSettings};
    use crate::services::store::{
        Account, ChatStore, DirectMessageRecord, MessageRecord, NewDirectMessage, NewRoomMessage, PresenceSink,
        PresenceStatus, Profile, RoomSummary, StoreError,
    };

    #[derive(Default)]
    struct FakeData {
        tokens: HashMap<String, Account>,
        profiles: HashMap<Uuid, Profile>,
        rooms: HashMap<Uuid, (String, HashSet<Uuid>)>,
        calls: Vec<&'static str>,
        presence: Vec<(Uuid, PresenceStatus)>,
        failing: HashSet<&'static str>,
        delays: HashMap<&'static str, Duration>,
        presence_delays: Vec<(PresenceStatus, Duration)>,
        room_messages: Vec<MessageRecord>,
        direct_messages: Vec<DirectMessageRecord>,
    }

    /// In-memory stand-in for every collaborator. Records each call.
    #[derive(Default)]
    pub struct FakeCollaborators {
        data: Mutex<FakeData>,
    }

    impl FakeCollaborators {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        #[must_use]
        pub fn collaborators(self: &Arc<Self>) -> Collaborators {
            Collaborators { store: self.clone(), identity: self.clone(), presence: self.clone() }
        }

        #[must_use]
        pub fn token_for(username: &str) -> String {
            format!("token-{username}")
        }

        /// Create an account reachable via `token_for(username)`.
        pub fn add_account(&self, username: &str) -> Account {
            let account = Account { id: Uuid::new_v4(), username: username.into() };
            let mut data = self.data.lock().unwrap();
            data.tokens
                .insert(Self::token_for(username), account.clone());
            data.profiles.insert(
                account.id,
                Profile {
                    username: username.into(),
                    display_name: format!("{username} (display)"),
                    avatar_url: Some(format!("https://avatars.test/{username}.png")),
                },
            );
            account
        }

        pub fn add_room(&self, name: &str, members: &[Uuid]) -> Uuid {
            let room_id = Uuid::new_v4();
            self.data
                .lock()
                .unwrap()
                .rooms
                .insert(room_id, (name.into(), members.iter().copied().collect()));
            room_id
        }

        pub fn fail(&self, op: &'static str) {
            self.data.lock().unwrap().failing.insert(op);
        }

        pub fn delay(&self, op: &'static str, by: Duration) {
            self.data.lock().unwrap().delays.insert(op, by);
        }

        /// Delay only presence-sink calls carrying `status`.
        pub fn delay_presence(&self, status: PresenceStatus, by: Duration) {
            self.data.lock().unwrap().presence_delays.push((status, by));
        }

        #[must_use]
        pub fn calls(&self) -> Vec<&'static str> {
            self.data.lock().unwrap().calls.clone()
        }

        #[must_use]
        pub fn presence_calls(&self) -> Vec<(Uuid, PresenceStatus)> {
            self.data.lock().unwrap().presence.clone()
        }

        #[must_use]
        pub fn room_message_count(&self) -> usize {
            self.data.lock().unwrap().room_messages.len()
        }

        /// Record the call, then apply any injected delay or failure.
        async fn gate(&self, op: &'static str) -> Result<(), StoreError> {
            let (delay, fail) = {
                let mut data = self.data.lock().unwrap();
                data.calls.push(op);
                (data.delays.get(op).copied(), data.failing.contains(op))
            };
            if let Some(by) = delay {
                tokio::time::sleep(by).await;
            }
            if fail {
                return Err(StoreError::Other(format!("injected {op} failure")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChatStore for FakeCollaborators {
        async fn is_member(&self, room_id: Uuid, account_id: Uuid) -> Result<bool, StoreError> {
            self.gate("is_member").await?;
            let data = self.data.lock().unwrap();
            Ok(data
                .rooms
                .get(&room_id)
                .is_some_and(|(_, members)| members.contains(&account_id)))
        }

        async fn room_summary(&self, room_id: Uuid) -> Result<RoomSummary, StoreError> {
            self.gate("room_summary").await?;
            let data = self.data.lock().unwrap();
            let (name, members) = data
                .rooms
                .get(&room_id)
                .ok_or_else(|| StoreError::NotFound(format!("room {room_id}")))?;
            Ok(RoomSummary { name: name.clone(), member_count: i64::try_from(members.len()).unwrap_or(i64::MAX) })
        }

        async fn account_rooms(&self, account_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
            self.gate("account_rooms").await?;
            let data = self.data.lock().unwrap();
            Ok(data
                .rooms
                .iter()
                .filter(|(_, (_, members))| members.contains(&account_id))
                .map(|(id, _)| *id)
                .collect())
        }

        async fn create_room_message(&self, message: NewRoomMessage) -> Result<MessageRecord, StoreError> {
            self.gate("create_room_message").await?;
            let record = MessageRecord {
                id: Uuid::new_v4(),
                room_id: message.room_id,
                user_id: message.user_id,
                content: message.content,
                message_type: message.message_type,
                reply_to_id: message.reply_to_id,
                created_at: OffsetDateTime::now_utc(),
            };
            self.data
                .lock()
                .unwrap()
                .room_messages
                .push(record.clone());
            Ok(record)
        }

        async fn create_direct_message(&self, message: NewDirectMessage) -> Result<DirectMessageRecord, StoreError> {
            self.gate("create_direct_message").await?;
            let record = DirectMessageRecord {
                id: Uuid::new_v4(),
                sender_id: message.sender_id,
                receiver_id: message.receiver_id,
                content: message.content,
                message_type: message.message_type,
                created_at: OffsetDateTime::now_utc(),
            };
            self.data
                .lock()
                .unwrap()
                .direct_messages
                .push(record.clone());
            Ok(record)
        }

        async fn mark_room_read(&self, _room_id: Uuid, _account_id: Uuid) -> Result<(), StoreError> {
            self.gate("mark_room_read").await
        }

        async fn mark_direct_read(&self, _reader_id: Uuid, _sender_id: Uuid) -> Result<OffsetDateTime, StoreError> {
            self.gate("mark_direct_read").await?;
            Ok(OffsetDateTime::now_utc())
        }
    }

    #[async_trait]
    impl Identity for FakeCollaborators {
        async fn verify(&self, token: &str) -> Result<Option<Account>, StoreError> {
            self.gate("verify").await?;
            Ok(self.data.lock().unwrap().tokens.get(token).cloned())
        }

        async fn profile(&self, account_id: Uuid) -> Result<Profile, StoreError> {
            self.gate("profile").await?;
            self.data
                .lock()
                .unwrap()
                .profiles
                .get(&account_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("user {account_id}")))
        }
    }

    #[async_trait]
    impl PresenceSink for FakeCollaborators {
        async fn set_presence(&self, account_id: Uuid, status: PresenceStatus) -> Result<(), StoreError> {
            self.gate("set_presence").await?;
            let delay = self
                .data
                .lock()
                .unwrap()
                .presence_delays
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, by)| *by);
            if let Some(by) = delay {
                tokio::time::sleep(by).await;
            }
            self.data
                .lock()
                .unwrap()
                .presence
                .push((account_id, status));
            Ok(())
        }
    }

    // =========================================================================
    // HUB / CONNECTION HELPERS
    // =========================================================================

    pub const TEST_QUEUE_CAPACITY: usize = 64;

    #[must_use]
    pub fn test_settings() -> HubSettings {
        HubSettings { collaborator_timeout: Duration::from_millis(200), ..HubSettings::default() }
    }

    #[must_use]
    pub fn test_hub(fake: &Arc<FakeCollaborators>) -> Hub {
        Hub::new(fake.collaborators(), test_settings(), None)
    }

    #[must_use]
    pub fn test_app_state(fake: &Arc<FakeCollaborators>) -> AppState {
        AppState::new(test_hub(fake), ConnectionLimits::default())
    }

    /// Create and register a connection for `account`.
    pub async fn connect(hub: &Hub, account: &Account) -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        connect_with_capacity(hub, account, TEST_QUEUE_CAPACITY).await
    }

    pub async fn connect_with_capacity(
        hub: &Hub,
        account: &Account,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        let (conn, rx) = Connection::new(account.clone(), capacity);
        hub.register(Arc::clone(&conn)).await;
        (conn, rx)
    }

    /// Receive the next envelope of `kind`, skipping anything else.
    pub async fn recv_kind(rx: &mut mpsc::Receiver<Envelope>, kind: Kind) -> Envelope {
        timeout(Duration::from_millis(500), async {
            loop {
                let env = rx.recv().await.expect("queue closed unexpectedly");
                if env.kind == kind {
                    return env;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
    }

    /// Assert that no envelope of `kind` arrives within a short window.
    pub async fn assert_no_kind(rx: &mut mpsc::Receiver<Envelope>, kind: Kind) {
        let seen = timeout(Duration::from_millis(80), async {
            while let Some(env) = rx.recv().await {
                if env.kind == kind {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(!matches!(seen, Ok(true)), "unexpected {kind:?} envelope");
    }

    /// Poll `cond` until it holds or the deadline passes.
    pub async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
