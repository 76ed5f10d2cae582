//! # banter-core
//!
//! Realtime coordination engine for the Banter chat server.
//!
//! This crate sits between client connections and the durable message
//! store. It reconciles three lifetimes in one system: transient connection
//! state, ephemeral conversation state (typing, presence) and durable state
//! (messages, reactions, read receipts).
//!
//! - **Presence** - Who is online, one entry per identity
//! - **Rooms** - Which connection is subscribed to which room
//! - **Typing** - Who is typing in which conversation
//! - **Engine** - Message routing, reactions, read receipts
//! - **History** - Paginated and searched message queries
//! - **Store** - Seam to the durable store, with a bundled in-memory impl
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Gateway   │────▶│   Engine    │────▶│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!              ┌─────────────┼─────────────┐
//!              ▼             ▼             ▼
//!        ┌──────────┐  ┌──────────┐  ┌──────────┐
//!        │ Presence │  │  Rooms   │  │  Typing  │
//!        └──────────┘  └──────────┘  └──────────┘
//! ```

pub mod engine;
pub mod error;
pub mod history;
pub mod presence;
pub mod rooms;
pub mod scope;
pub mod store;
pub mod typing;

pub use engine::{Engine, EngineConfig, EngineStats, SendRequest};
pub use error::CoreError;
pub use history::HistoryService;
pub use presence::{ConnectionHandle, ConnectionId, OutboundSender, PresenceEntry, PresenceRegistry};
pub use rooms::RoomSubscriptions;
pub use scope::{PairKey, Scope};
pub use store::{HistoryFilter, MemoryStore, StoreAdapter, StoreError, UserRecord};
pub use typing::TypingTracker;
