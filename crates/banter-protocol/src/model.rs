//! Domain types shared between the engine and its clients.
//!
//! These are the durable shapes: identities, messages, receipts and
//! reactions. They are owned by the store; the engine only ever holds the
//! current working set.

use serde::{Deserialize, Serialize};

/// Opaque unique user key.
pub type UserId = String;

/// Room identifier.
pub type RoomId = String;

/// Unique message identifier.
pub type MessageId = u64;

/// An authenticated user identity.
///
/// Derived once from a verified token at connection time and immutable for
/// the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Opaque unique user key.
    pub id: UserId,
    /// Display name.
    pub name: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Live or persisted user status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
}

/// Kind of message content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    Image,
}

/// Closed set of reactions a user can attach to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Love,
    Laugh,
    Angry,
    Sad,
}

/// Reference to an uploaded file, produced by the external upload service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Where the file can be fetched from.
    pub url: String,
    /// Original file name.
    pub name: String,
}

/// A read receipt on a message. At most one per reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Who read the message.
    pub reader: UserId,
    /// When they read it (unix milliseconds).
    pub read_at: u64,
}

/// A reaction on a message. At most one active per reactor; adding a new
/// one replaces any prior reaction by the same user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Who reacted.
    pub reactor: UserId,
    /// Which reaction.
    pub kind: ReactionKind,
    /// When (unix milliseconds).
    pub created_at: u64,
}

/// A persisted chat message.
///
/// Immutable once created except for `read_by` (append-only, unique per
/// reader) and `reactions` (replace-by-reactor). Exactly one of `room` and
/// `recipient` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Who sent it.
    pub sender: Identity,
    /// Message content.
    pub content: String,
    /// Destination room, for room messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    /// Destination user, for private messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<UserId>,
    /// Content kind.
    #[serde(default)]
    pub kind: MessageKind,
    /// Attached file reference, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
    /// Read receipts, ordered by read time.
    pub read_by: Vec<ReadReceipt>,
    /// Active reactions.
    pub reactions: Vec<Reaction>,
    /// Creation time (unix milliseconds).
    pub created_at: u64,
}

impl Message {
    /// Check whether a user has read this message.
    #[must_use]
    pub fn is_read_by(&self, user: &str) -> bool {
        self.read_by.iter().any(|r| r.reader == user)
    }

    /// Get a user's active reaction, if any.
    #[must_use]
    pub fn reaction_of(&self, user: &str) -> Option<&Reaction> {
        self.reactions.iter().find(|r| r.reactor == user)
    }
}

/// A conversation target as addressed by a client: a room, or the other
/// party of a private chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// A shared room.
    Room(RoomId),
    /// The peer of a one-to-one conversation.
    User(UserId),
}

/// Presence information for one online identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
    /// Who.
    pub user: Identity,
    /// Current live status.
    pub status: UserStatus,
    /// Last activity (unix milliseconds).
    pub last_seen: u64,
}
