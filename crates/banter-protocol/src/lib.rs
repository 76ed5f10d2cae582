//! # banter-protocol
//!
//! Wire protocol definitions for the Banter realtime chat engine.
//!
//! This crate provides:
//!
//! - **Model** - Shared domain types (identities, messages, reactions)
//! - **Events** - Client-to-server and server-to-client event enums
//! - **Codec** - MessagePack serialization with length-prefixed framing

pub mod codec;
pub mod events;
pub mod model;

pub use codec::ProtocolError;
pub use events::{ClientEvent, NotificationKind, ServerEvent};
pub use model::{
    FileRef, Identity, Message, MessageId, MessageKind, PresenceInfo, Reaction, ReactionKind,
    ReadReceipt, RoomId, Target, UserId, UserStatus,
};
