//! Durable storage seam.
//!
//! The real query/index implementation lives outside the engine; the engine
//! only issues scoped read/write requests through the [`StoreAdapter`]
//! trait. [`MemoryStore`] is the bundled implementation used by the default
//! server binary and the test suite.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use banter_protocol::model::{
    Identity, Message, MessageId, Reaction, ReadReceipt, RoomId, UserId, UserStatus,
};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A message referenced by id does not exist.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// The durable store could not complete the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A durable user record. Distinct from live presence: this is the
/// last-known persisted status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Who.
    pub identity: Identity,
    /// Last persisted status.
    pub status: UserStatus,
    /// Last seen (unix milliseconds).
    pub last_seen: u64,
}

/// Filter applied to history queries. Results are always newest-first.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Case-insensitive substring match over content.
    pub query: Option<String>,
    /// Only messages strictly older than this timestamp.
    pub before: Option<u64>,
    /// Maximum number of results.
    pub limit: usize,
}

impl HistoryFilter {
    /// A plain page of the most recent messages.
    #[must_use]
    pub fn page(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Restrict to messages strictly older than a cursor.
    #[must_use]
    pub fn before(mut self, cursor: Option<u64>) -> Self {
        self.before = cursor;
        self
    }

    /// Add a content substring query.
    #[must_use]
    pub fn matching(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// Asynchronous CRUD/query surface over Users and Messages.
///
/// All queries are scoped; all operations return either a result or a typed
/// failure.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Persist a new message.
    async fn create_message(&self, message: Message) -> Result<(), StoreError>;

    /// Fetch a single message by id.
    async fn message_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Messages addressed to a room, newest first.
    async fn messages_by_room(
        &self,
        room: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<Message>, StoreError>;

    /// Private messages between two users in either direction, newest first.
    async fn messages_by_pair(
        &self,
        a: &str,
        b: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<Message>, StoreError>;

    /// Append a read receipt if the reader has none yet.
    ///
    /// Returns `true` if the receipt was newly added, `false` if the reader
    /// had already read the message.
    async fn update_read_by(
        &self,
        id: MessageId,
        receipt: ReadReceipt,
    ) -> Result<bool, StoreError>;

    /// Set a user's reaction on a message, replacing any prior reaction by
    /// the same user.
    async fn update_reactions(&self, id: MessageId, reaction: Reaction) -> Result<(), StoreError>;

    /// Fetch a durable user record.
    async fn user_by_id(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Upsert a user's persisted status and last-seen timestamp.
    async fn update_user_status(
        &self,
        identity: &Identity,
        status: UserStatus,
        last_seen: u64,
    ) -> Result<(), StoreError>;
}

/// In-memory store backed by concurrent maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<MessageId, Message>,
    users: DashMap<UserId, UserRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn collect<F>(&self, filter: &HistoryFilter, matches_scope: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let query = filter.query.as_ref().map(|q| q.to_lowercase());

        let mut results: Vec<Message> = self
            .messages
            .iter()
            .filter(|entry| matches_scope(entry.value()))
            .filter(|entry| {
                filter
                    .before
                    .map_or(true, |cursor| entry.value().created_at < cursor)
            })
            .filter(|entry| {
                query
                    .as_ref()
                    .map_or(true, |q| entry.value().content.to_lowercase().contains(q))
            })
            .map(|entry| entry.value().clone())
            .collect();

        // Newest first, id as tiebreaker for same-millisecond messages.
        results.sort_by(|x, y| (y.created_at, y.id).cmp(&(x.created_at, x.id)));
        results.truncate(filter.limit);
        results
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn create_message(&self, message: Message) -> Result<(), StoreError> {
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn message_by_id(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn messages_by_room(
        &self,
        room: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.collect(&filter, |m| m.room.as_deref() == Some(room)))
    }

    async fn messages_by_pair(
        &self,
        a: &str,
        b: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.collect(&filter, |m| {
            m.room.is_none()
                && ((m.sender.id == a && m.recipient.as_deref() == Some(b))
                    || (m.sender.id == b && m.recipient.as_deref() == Some(a)))
        }))
    }

    async fn update_read_by(
        &self,
        id: MessageId,
        receipt: ReadReceipt,
    ) -> Result<bool, StoreError> {
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;

        if message.is_read_by(&receipt.reader) {
            return Ok(false);
        }
        message.read_by.push(receipt);
        Ok(true)
    }

    async fn update_reactions(&self, id: MessageId, reaction: Reaction) -> Result<(), StoreError> {
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;

        message.reactions.retain(|r| r.reactor != reaction.reactor);
        message.reactions.push(reaction);
        Ok(())
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn update_user_status(
        &self,
        identity: &Identity,
        status: UserStatus,
        last_seen: u64,
    ) -> Result<(), StoreError> {
        self.users.insert(
            identity.id.clone(),
            UserRecord {
                identity: identity.clone(),
                status,
                last_seen,
            },
        );
        Ok(())
    }
}
