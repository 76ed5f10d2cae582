//! Event types exchanged between clients and the engine.
//!
//! Inbound events always carry an authenticated identity attached by the
//! gateway; it is never part of the wire payload.

use serde::{Deserialize, Serialize};

use crate::model::{
    FileRef, Identity, Message, MessageId, MessageKind, PresenceInfo, Reaction, ReactionKind,
    RoomId, Target, UserId,
};

/// An event sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a room (implicitly leaving the current one).
    Join { room: RoomId },

    /// Leave a room.
    Leave { room: RoomId },

    /// Send a message to a room or a single recipient.
    ///
    /// Exactly one of `room` and `recipient` must be set.
    Send {
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        recipient: Option<UserId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<FileRef>,
    },

    /// The sender started typing in a conversation.
    Typing { target: Target },

    /// The sender stopped typing in a conversation.
    StopTyping { target: Target },

    /// Mark a message as read by the sender of this event.
    MarkRead { message_id: MessageId, target: Target },

    /// Attach a reaction to a message, replacing any prior reaction by the
    /// same user.
    AddReaction {
        message_id: MessageId,
        kind: ReactionKind,
        target: Target,
    },

    /// Search message history within a conversation.
    Search { query: String, target: Target },

    /// Load a page of messages strictly older than `before`.
    LoadOlder {
        target: Target,
        #[serde(skip_serializing_if = "Option::is_none")]
        before: Option<u64>,
    },
}

/// Kind of notification pushed alongside a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    PrivateMessage,
}

/// An event pushed by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full online set, answered to a newly-joined connection.
    PresenceSnapshot { users: Vec<PresenceInfo> },

    /// An identity came online.
    IdentityOnline { user: PresenceInfo },

    /// An identity went offline.
    IdentityOffline { user: PresenceInfo },

    /// Someone joined a room you are in.
    RoomJoined { user: Identity, room: RoomId },

    /// Someone left a room you are in.
    RoomLeft { user: Identity, room: RoomId },

    /// Recent history delivered on room join, oldest first.
    RoomHistory { room: RoomId, messages: Vec<Message> },

    /// A new message in one of your conversations.
    NewMessage { message: Message },

    /// Your message was durably persisted.
    MessageAck { message_id: MessageId },

    /// Best-effort unread-badge notification.
    Notification {
        kind: NotificationKind,
        text: String,
        sender: Identity,
    },

    /// Someone started typing.
    UserTyping {
        user: Identity,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },

    /// Someone stopped typing.
    UserStoppedTyping {
        user: Identity,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },

    /// A message was read by someone.
    MessageRead {
        message_id: MessageId,
        reader: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },

    /// A reaction was added to a message.
    ReactionAdded {
        message_id: MessageId,
        reaction: Reaction,
        #[serde(skip_serializing_if = "Option::is_none")]
        room: Option<RoomId>,
    },

    /// Results of a history search, newest first.
    SearchResults { messages: Vec<Message> },

    /// A page of older messages, oldest first for prepending.
    OlderMessages { messages: Vec<Message> },

    /// A request failed. Delivered only to the requesting connection.
    Error { code: u16, reason: String },
}

impl ServerEvent {
    /// Create a new error event.
    #[must_use]
    pub fn error(code: u16, reason: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            reason: reason.into(),
        }
    }
}
