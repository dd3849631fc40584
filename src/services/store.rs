//! Collaborator seams — persistence, identity, and presence.
//!
//! ARCHITECTURE
//! ============
//! The hub never talks to the database directly. It calls three narrow
//! traits injected as `Arc<dyn ...>`: `ChatStore` for membership and message
//! writes, `Identity` for credential verification and profiles, and
//! `PresenceSink` for online/offline bookkeeping. `PgStore` implements all
//! three over one `PgPool`; tests substitute an in-memory fake.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::envelope::MessageType;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

/// Authenticated account attached to a connection at upgrade time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
}

/// Public profile used to decorate outbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub name: String,
    pub member_count: i64,
}

#[derive(Debug, Clone)]
pub struct NewRoomMessage {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewDirectMessage {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
}

#[derive(Debug, Clone)]
pub struct DirectMessageRecord {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn is_member(&self, room_id: Uuid, account_id: Uuid) -> Result<bool, StoreError>;

    async fn room_summary(&self, room_id: Uuid) -> Result<RoomSummary, StoreError>;

    /// Rooms the account is a member of, used for presence fan-out.
    async fn account_rooms(&self, account_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    async fn create_room_message(&self, message: NewRoomMessage) -> Result<MessageRecord, StoreError>;

    async fn create_direct_message(&self, message: NewDirectMessage) -> Result<DirectMessageRecord, StoreError>;

    async fn mark_room_read(&self, room_id: Uuid, account_id: Uuid) -> Result<(), StoreError>;

    /// Mark every unread message from `sender_id` to `reader_id` as read.
    async fn mark_direct_read(&self, reader_id: Uuid, sender_id: Uuid) -> Result<OffsetDateTime, StoreError>;
}

#[async_trait]
pub trait Identity: Send + Sync {
    /// Resolve a bearer credential. `Ok(None)` means unknown or expired.
    async fn verify(&self, token: &str) -> Result<Option<Account>, StoreError>;

    async fn profile(&self, account_id: Uuid) -> Result<Profile, StoreError>;
}

#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn set_presence(&self, account_id: Uuid, status: PresenceStatus) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

/// Postgres-backed implementation of every collaborator trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn is_member(&self, room_id: Uuid, account_id: Uuid) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = $1 AND user_id = $2)")
                .bind(room_id)
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn room_summary(&self, room_id: Uuid) -> Result<RoomSummary, StoreError> {
        let row = sqlx::query(
            r"SELECT r.name, (SELECT COUNT(*) FROM room_members m WHERE m.room_id = r.id) AS member_count
              FROM rooms r
              WHERE r.id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("room {room_id}")))?;

        Ok(RoomSummary { name: row.get("name"), member_count: row.get("member_count") })
    }

    async fn account_rooms(&self, account_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rooms = sqlx::query_scalar("SELECT room_id FROM room_members WHERE user_id = $1")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rooms)
    }

    async fn create_room_message(&self, message: NewRoomMessage) -> Result<MessageRecord, StoreError> {
        let id = Uuid::new_v4();
        let created_at: OffsetDateTime = sqlx::query_scalar(
            r"INSERT INTO messages (id, room_id, user_id, content, type, reply_to_id)
              VALUES ($1, $2, $3, $4, $5, $6)
              RETURNING created_at",
        )
        .bind(id)
        .bind(message.room_id)
        .bind(message.user_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .bind(message.reply_to_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageRecord {
            id,
            room_id: message.room_id,
            user_id: message.user_id,
            content: message.content,
            message_type: message.message_type,
            reply_to_id: message.reply_to_id,
            created_at,
        })
    }

    async fn create_direct_message(&self, message: NewDirectMessage) -> Result<DirectMessageRecord, StoreError> {
        let id = Uuid::new_v4();
        let created_at: OffsetDateTime = sqlx::query_scalar(
            r"INSERT INTO direct_messages (id, sender_id, receiver_id, content, type)
              VALUES ($1, $2, $3, $4, $5)
              RETURNING created_at",
        )
        .bind(id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(&message.content)
        .bind(message.message_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(DirectMessageRecord {
            id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content,
            message_type: message.message_type,
            created_at,
        })
    }

    async fn mark_room_read(&self, room_id: Uuid, account_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE room_members SET last_read_at = now() WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("membership {room_id}/{account_id}")));
        }
        Ok(())
    }

    async fn mark_direct_read(&self, reader_id: Uuid, sender_id: Uuid) -> Result<OffsetDateTime, StoreError> {
        let read_at = OffsetDateTime::now_utc();
        sqlx::query(
            r"UPDATE direct_messages SET read_at = $3
              WHERE receiver_id = $1 AND sender_id = $2 AND read_at IS NULL",
        )
        .bind(reader_id)
        .bind(sender_id)
        .bind(read_at)
        .execute(&self.pool)
        .await?;
        Ok(read_at)
    }
}

#[async_trait]
impl Identity for PgStore {
    async fn verify(&self, token: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r"SELECT u.id, u.username
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Account { id: r.get("id"), username: r.get("username") }))
    }

    async fn profile(&self, account_id: Uuid) -> Result<Profile, StoreError> {
        let row = sqlx::query("SELECT username, display_name, avatar_url FROM users WHERE id = $1")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {account_id}")))?;

        let username: String = row.get("username");
        let display_name: Option<String> = row.get("display_name");
        Ok(Profile {
            display_name: display_name.unwrap_or_else(|| username.clone()),
            username,
            avatar_url: row.get("avatar_url"),
        })
    }
}

#[async_trait]
impl PresenceSink for PgStore {
    async fn set_presence(&self, account_id: Uuid, status: PresenceStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET status = $2, last_seen_at = now() WHERE id = $1")
            .bind(account_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
