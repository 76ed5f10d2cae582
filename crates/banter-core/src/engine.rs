//! The coordination engine.
//!
//! One `Engine` instance owns all live state: the presence registry, room
//! subscriptions, typing tracker and the store seam. It is created at
//! process start, shared across connection tasks, and accessed only through
//! its API — there are no ambient globals. Every inbound operation carries
//! the authenticated connection it came from; every failure is returned to
//! the caller for delivery to that connection only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::history::HistoryService;
use crate::presence::{ConnectionHandle, ConnectionId, OutboundSender, PresenceRegistry};
use crate::rooms::RoomSubscriptions;
use crate::scope::{PairKey, Scope};
use crate::store::{HistoryFilter, StoreAdapter};
use crate::typing::TypingTracker;
use banter_protocol::events::{NotificationKind, ServerEvent};
use banter_protocol::model::{
    FileRef, Identity, Message, MessageId, MessageKind, Reaction, ReactionKind, ReadReceipt,
    RoomId, Target, UserId, UserStatus,
};

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Recent messages delivered on room join.
    pub room_history_limit: usize,
    /// Page size for older-message loads.
    pub page_size: usize,
    /// Maximum search results.
    pub search_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            room_history_limit: 50,
            page_size: 20,
            search_limit: 20,
        }
    }
}

/// An inbound send request, already stripped of transport concerns.
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Message content.
    pub content: String,
    /// Content kind.
    pub kind: MessageKind,
    /// Destination room.
    pub room: Option<RoomId>,
    /// Destination user.
    pub recipient: Option<UserId>,
    /// Attached file reference.
    pub file: Option<FileRef>,
}

/// One authenticated live connection.
#[derive(Debug, Clone)]
struct Session {
    identity: Identity,
    handle: ConnectionHandle,
}

/// Engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Identities currently online.
    pub online_users: usize,
    /// Live connections.
    pub connections: usize,
    /// Rooms with at least one subscriber.
    pub active_rooms: usize,
}

/// The realtime coordination engine.
pub struct Engine {
    store: Arc<dyn StoreAdapter>,
    presence: PresenceRegistry,
    rooms: RoomSubscriptions,
    typing: TypingTracker,
    history: HistoryService,
    sessions: DashMap<ConnectionId, Session>,
    config: EngineConfig,
}

impl Engine {
    /// Create a new engine over a store with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create a new engine with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn StoreAdapter>, config: EngineConfig) -> Self {
        info!("Creating engine with config: {:?}", config);
        let history = HistoryService::new(store.clone(), config.search_limit, config.page_size);
        Self {
            store,
            presence: PresenceRegistry::new(),
            rooms: RoomSubscriptions::new(),
            typing: TypingTracker::new(),
            history,
            sessions: DashMap::new(),
            config,
        }
    }

    /// Get engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            online_users: self.presence.count(),
            connections: self.sessions.len(),
            active_rooms: self.rooms.room_count(),
        }
    }

    /// The presence registry (read access for gateways).
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Register an authenticated connection.
    ///
    /// Marks the identity online, broadcasts the transition to every other
    /// connection and persists the status change best-effort.
    pub async fn connect(&self, identity: Identity, conn_id: ConnectionId, sender: OutboundSender) {
        let handle = ConnectionHandle::new(conn_id.clone(), sender);
        self.sessions.insert(
            conn_id.clone(),
            Session {
                identity: identity.clone(),
                handle: handle.clone(),
            },
        );

        let previous = self.presence.register(identity.clone(), handle);
        if let Some(prev) = previous {
            debug!(user = %identity.id, old_connection = %prev.handle.conn_id, "Reconnection");
        }

        let entry = self.presence.lookup(&identity.id);
        if let Some(entry) = entry {
            self.presence
                .broadcast_except(&identity.id, &ServerEvent::IdentityOnline { user: entry.info() });
        }

        if let Err(e) = self
            .store
            .update_user_status(&identity, UserStatus::Online, now_ms())
            .await
        {
            warn!(user = %identity.id, error = %e, "Status persist failed on connect");
        }

        info!(user = %identity.id, connection = %conn_id, "Connected");
    }

    /// Tear down a dropped connection.
    ///
    /// Cleanup is best-effort: typing scopes are cleared one by one, room
    /// membership is released, the presence entry is removed (unless a
    /// reconnection already replaced it) and the offline transition is
    /// broadcast and persisted.
    pub async fn disconnect(&self, conn_id: &str) {
        let Some((_, session)) = self.sessions.remove(conn_id) else {
            return;
        };
        let identity = session.identity;

        for scope in self.typing.clear_user(&identity.id) {
            let event = ServerEvent::UserStoppedTyping {
                user: identity.clone(),
                room: scope.room_id().cloned(),
            };
            self.broadcast_scope(&scope, &identity.id, conn_id, &event);
        }

        if let Some(room) = self.rooms.remove_connection(conn_id) {
            self.broadcast_room(
                &room,
                None,
                &ServerEvent::RoomLeft {
                    user: identity.clone(),
                    room: room.clone(),
                },
            );
        }

        if let Some(entry) = self.presence.unregister(&identity.id, conn_id) {
            self.presence
                .broadcast_except(&identity.id, &ServerEvent::IdentityOffline { user: entry.info() });

            if let Err(e) = self
                .store
                .update_user_status(&identity, UserStatus::Offline, entry.last_seen)
                .await
            {
                warn!(user = %identity.id, error = %e, "Status persist failed on disconnect");
            }
        }

        info!(user = %identity.id, connection = %conn_id, "Disconnected");
    }

    /// Subscribe a connection to a room.
    ///
    /// Joining a new room implicitly leaves the previous one. The joiner
    /// receives the presence snapshot and the room's recent history; the
    /// room receives a join notice.
    ///
    /// # Errors
    ///
    /// Returns a store failure if the history load fails; the subscription
    /// itself still stands.
    pub async fn join_room(&self, conn_id: &str, room: &str) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;

        if let Some(previous) = self.rooms.join(conn_id, room) {
            self.broadcast_room(
                &previous,
                None,
                &ServerEvent::RoomLeft {
                    user: session.identity.clone(),
                    room: previous.clone(),
                },
            );
        }

        self.broadcast_room(
            room,
            None,
            &ServerEvent::RoomJoined {
                user: session.identity.clone(),
                room: room.to_string(),
            },
        );

        session.handle.push(ServerEvent::PresenceSnapshot {
            users: self.presence.snapshot(),
        });

        let mut recent = self
            .store
            .messages_by_room(room, HistoryFilter::page(self.config.room_history_limit))
            .await?;
        recent.reverse();
        session.handle.push(ServerEvent::RoomHistory {
            room: room.to_string(),
            messages: recent,
        });

        debug!(user = %session.identity.id, room = %room, "Joined room");
        Ok(())
    }

    /// Unsubscribe a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub async fn leave_room(&self, conn_id: &str, room: &str) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;

        if self.rooms.leave(conn_id, room) {
            self.broadcast_room(
                room,
                None,
                &ServerEvent::RoomLeft {
                    user: session.identity.clone(),
                    room: room.to_string(),
                },
            );
            debug!(user = %session.identity.id, room = %room, "Left room");
        }
        Ok(())
    }

    /// Route a message: validate, persist, then fan out.
    ///
    /// Persistence happens-before fan-out, so no client ever observes a
    /// message id that is not yet durable. A persistence failure aborts the
    /// route entirely; no partial fan-out occurs.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a request without exactly one destination,
    /// or a store failure.
    pub async fn send_message(
        &self,
        conn_id: &str,
        request: SendRequest,
    ) -> Result<MessageId, CoreError> {
        let session = self.session(conn_id)?;
        let sender = session.identity.clone();

        if request.room.is_some() == request.recipient.is_some() {
            return Err(CoreError::Validation(
                "message must target exactly one of room or recipient",
            ));
        }
        if request.content.is_empty() && request.file.is_none() {
            return Err(CoreError::Validation("message content is empty"));
        }

        let now = now_ms();
        let message = Message {
            id: generate_message_id(),
            sender: sender.clone(),
            content: request.content,
            room: request.room,
            recipient: request.recipient,
            kind: request.kind,
            file: request.file,
            read_by: vec![ReadReceipt {
                reader: sender.id.clone(),
                read_at: now,
            }],
            reactions: vec![],
            created_at: now,
        };
        let message_id = message.id;

        self.store.create_message(message.clone()).await?;

        if let Some(room) = &message.room {
            let event = ServerEvent::NewMessage {
                message: message.clone(),
            };
            let notification = ServerEvent::Notification {
                kind: NotificationKind::Message,
                text: format!("New message in {room}"),
                sender: sender.clone(),
            };
            for member in self.rooms.members(room) {
                if member == conn_id {
                    continue;
                }
                self.push_to_conn(&member, event.clone());
                self.push_to_conn(&member, notification.clone());
            }
            debug!(
                message = message_id,
                room = %room,
                recipients = self.rooms.member_count(room).saturating_sub(1),
                "Routed room message"
            );
        } else if let Some(recipient) = &message.recipient {
            // No delivery attempt and no queuing for an offline
            // recipient; history covers them on their next connect.
            if let Some(entry) = self.presence.lookup(recipient) {
                entry.handle.push(ServerEvent::NewMessage {
                    message: message.clone(),
                });
                entry.handle.push(ServerEvent::Notification {
                    kind: NotificationKind::PrivateMessage,
                    text: format!("New message from {}", sender.name),
                    sender: sender.clone(),
                });
                debug!(message = message_id, to = %recipient, "Routed private message");
            } else {
                debug!(message = message_id, to = %recipient, "Recipient offline, persisted only");
            }
        }

        session.handle.push(ServerEvent::MessageAck { message_id });
        Ok(message_id)
    }

    /// The sender started typing in a conversation. Idempotent; always
    /// re-broadcast to the scope's other participants.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub fn start_typing(&self, conn_id: &str, target: &Target) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;
        let scope = Scope::resolve(&session.identity.id, target);

        self.typing.start(&session.identity.id, &scope);
        let event = ServerEvent::UserTyping {
            user: session.identity.clone(),
            room: scope.room_id().cloned(),
        };
        self.broadcast_scope(&scope, &session.identity.id, conn_id, &event);
        Ok(())
    }

    /// The sender stopped typing. Stopping when absent is a no-op and
    /// produces no duplicate broadcast.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not registered.
    pub fn stop_typing(&self, conn_id: &str, target: &Target) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;
        let scope = Scope::resolve(&session.identity.id, target);

        if self.typing.stop(&session.identity.id, &scope) {
            let event = ServerEvent::UserStoppedTyping {
                user: session.identity.clone(),
                room: scope.room_id().cloned(),
            };
            self.broadcast_scope(&scope, &session.identity.id, conn_id, &event);
        }
        Ok(())
    }

    /// Mark a message read by the requester.
    ///
    /// Idempotent set semantics: a repeated call changes nothing and
    /// broadcasts nothing. The broadcast goes to the message's own
    /// destination scope.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown message, `ScopeViolation` if the
    /// requester is not party to the conversation, or a store failure.
    pub async fn mark_read(&self, conn_id: &str, message_id: MessageId) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;
        let reader = session.identity.id.clone();

        let message = self
            .store
            .message_by_id(message_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;
        let scope = Self::message_scope(&reader, &message)?;

        let newly = self
            .store
            .update_read_by(
                message_id,
                ReadReceipt {
                    reader: reader.clone(),
                    read_at: now_ms(),
                },
            )
            .await?;

        if newly {
            let event = ServerEvent::MessageRead {
                message_id,
                reader: reader.clone(),
                room: scope.room_id().cloned(),
            };
            self.broadcast_scope(&scope, &reader, conn_id, &event);
        }
        Ok(())
    }

    /// Attach a reaction to a message, replacing any prior reaction by the
    /// requester, then broadcast the delta to the message's destination
    /// scope.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown message, `ScopeViolation` if the
    /// requester is not party to the conversation, or a store failure.
    pub async fn add_reaction(
        &self,
        conn_id: &str,
        message_id: MessageId,
        kind: ReactionKind,
    ) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;
        let reactor = session.identity.id.clone();

        let message = self
            .store
            .message_by_id(message_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))?;
        let scope = Self::message_scope(&reactor, &message)?;

        let reaction = Reaction {
            reactor: reactor.clone(),
            kind,
            created_at: now_ms(),
        };
        self.store
            .update_reactions(message_id, reaction.clone())
            .await?;

        let event = ServerEvent::ReactionAdded {
            message_id,
            reaction,
            room: scope.room_id().cloned(),
        };
        self.broadcast_scope(&scope, &reactor, conn_id, &event);
        Ok(())
    }

    /// Search message history within a conversation; results go back to the
    /// requesting connection only.
    ///
    /// # Errors
    ///
    /// Returns `ScopeViolation` or a store failure.
    pub async fn search(
        &self,
        conn_id: &str,
        target: &Target,
        query: &str,
    ) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;
        let scope = Scope::resolve(&session.identity.id, target);

        let messages = self.history.search(&session.identity.id, &scope, query).await?;
        session.handle.push(ServerEvent::SearchResults { messages });
        Ok(())
    }

    /// Load a page of messages strictly older than the cursor; the page goes
    /// back to the requesting connection only, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `ScopeViolation` or a store failure.
    pub async fn load_older(
        &self,
        conn_id: &str,
        target: &Target,
        before: Option<u64>,
    ) -> Result<(), CoreError> {
        let session = self.session(conn_id)?;
        let scope = Scope::resolve(&session.identity.id, target);

        let messages = self
            .history
            .load_older(&session.identity.id, &scope, before)
            .await?;
        session.handle.push(ServerEvent::OlderMessages { messages });
        Ok(())
    }

    fn session(&self, conn_id: &str) -> Result<Session, CoreError> {
        self.sessions
            .get(conn_id)
            .map(|s| s.clone())
            .ok_or_else(|| CoreError::Auth("connection not registered".into()))
    }

    /// Scope a message's broadcast to its own destination, checking that the
    /// requester is party to a private conversation.
    fn message_scope(requester: &str, message: &Message) -> Result<Scope, CoreError> {
        match (&message.room, &message.recipient) {
            (Some(room), _) => Ok(Scope::Room(room.clone())),
            (None, Some(recipient)) => {
                let pair = PairKey::new(message.sender.id.clone(), recipient.clone());
                if !pair.involves(requester) {
                    return Err(CoreError::ScopeViolation);
                }
                Ok(Scope::Direct(pair))
            }
            (None, None) => Err(CoreError::Validation("message has no destination")),
        }
    }

    fn push_to_conn(&self, conn_id: &str, event: ServerEvent) {
        if let Some(session) = self.sessions.get(conn_id) {
            session.handle.push(event);
        }
    }

    fn broadcast_room(&self, room: &str, except_conn: Option<&str>, event: &ServerEvent) {
        for member in self.rooms.members(room) {
            if except_conn == Some(member.as_str()) {
                continue;
            }
            self.push_to_conn(&member, event.clone());
        }
    }

    /// Deliver an event to a scope's participants other than the subject:
    /// the room's other subscribers, or the other half of a private pair.
    fn broadcast_scope(&self, scope: &Scope, subject: &str, subject_conn: &str, event: &ServerEvent) {
        match scope {
            Scope::Room(room) => self.broadcast_room(room, Some(subject_conn), event),
            Scope::Direct(pair) => {
                if let Some(peer) = pair.peer_of(subject) {
                    self.presence.push_to(peer, event.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Client {
        conn_id: String,
        rx: UnboundedReceiver<ServerEvent>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    async fn connect(engine: &Engine, id: &str, name: &str) -> Client {
        let conn_id = format!("conn-{id}");
        let (tx, rx) = unbounded_channel();
        engine.connect(Identity::new(id, name), conn_id.clone(), tx).await;
        Client { conn_id, rx }
    }

    fn engine() -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Engine::new(store.clone()), store)
    }

    fn room_request(content: &str, room: &str) -> SendRequest {
        SendRequest {
            content: content.into(),
            kind: MessageKind::Text,
            room: Some(room.into()),
            recipient: None,
            file: None,
        }
    }

    fn private_request(content: &str, recipient: &str) -> SendRequest {
        SendRequest {
            content: content.into(),
            kind: MessageKind::Text,
            room: None,
            recipient: Some(recipient.into()),
            file: None,
        }
    }

    #[tokio::test]
    async fn test_room_message_fan_out() {
        let (engine, _store) = engine();
        let mut alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        engine.join_room(&alice.conn_id, "general").await.unwrap();
        engine.join_room(&bob.conn_id, "general").await.unwrap();
        alice.drain();
        bob.drain();

        let id = engine
            .send_message(&alice.conn_id, room_request("hi", "general"))
            .await
            .unwrap();

        let bob_events = bob.drain();
        let delivered = bob_events.iter().find_map(|e| match e {
            ServerEvent::NewMessage { message } => Some(message),
            _ => None,
        });
        let message = delivered.expect("bob should receive the message");
        assert_eq!(message.content, "hi");
        assert_eq!(message.sender.id, "u1");
        assert_eq!(message.room.as_deref(), Some("general"));
        assert_eq!(message.read_by.len(), 1);
        assert_eq!(message.read_by[0].reader, "u1");
        assert!(bob_events
            .iter()
            .any(|e| matches!(e, ServerEvent::Notification { .. })));

        let alice_events = alice.drain();
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageAck { message_id } if *message_id == id)));
        assert!(!alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage { .. })));
    }

    #[tokio::test]
    async fn test_destination_must_be_exactly_one() {
        let (engine, store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;

        let both = SendRequest {
            recipient: Some("u2".into()),
            ..room_request("hi", "general")
        };
        assert!(matches!(
            engine.send_message(&alice.conn_id, both).await,
            Err(CoreError::Validation(_))
        ));

        let neither = SendRequest {
            content: "hi".into(),
            kind: MessageKind::Text,
            room: None,
            recipient: None,
            file: None,
        };
        assert!(matches!(
            engine.send_message(&alice.conn_id, neither).await,
            Err(CoreError::Validation(_))
        ));

        // Never persisted.
        assert_eq!(store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_private_message_to_offline_recipient() {
        let (engine, _store) = engine();
        let mut alice = connect(&engine, "u1", "Alice").await;

        let id = engine
            .send_message(&alice.conn_id, private_request("psst", "u2"))
            .await
            .unwrap();
        assert!(alice
            .drain()
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageAck { message_id } if *message_id == id)));

        // Bob connects later and pages the pair history.
        let mut bob = connect(&engine, "u2", "Bob").await;
        assert!(!bob.drain().iter().any(|e| matches!(e, ServerEvent::NewMessage { .. })));

        engine
            .load_older(&bob.conn_id, &Target::User("u1".into()), None)
            .await
            .unwrap();
        let page = bob.drain().into_iter().find_map(|e| match e {
            ServerEvent::OlderMessages { messages } => Some(messages),
            _ => None,
        });
        let page = page.expect("bob should receive the page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "psst");
    }

    #[tokio::test]
    async fn test_private_message_delivered_when_online() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;
        bob.drain();

        engine
            .send_message(&alice.conn_id, private_request("hello", "u2"))
            .await
            .unwrap();

        let events = bob.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage { message } if message.content == "hello")));
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::Notification {
                kind: NotificationKind::PrivateMessage,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_reaction_replaces_prior_reaction() {
        let (engine, store) = engine();
        let mut alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        let id = engine
            .send_message(&alice.conn_id, private_request("react to me", "u2"))
            .await
            .unwrap();
        alice.drain();
        bob.drain();

        engine.add_reaction(&bob.conn_id, id, ReactionKind::Like).await.unwrap();
        engine.add_reaction(&bob.conn_id, id, ReactionKind::Love).await.unwrap();

        let message = store.message_by_id(id).await.unwrap().unwrap();
        assert_eq!(message.reactions.len(), 1);
        assert_eq!(message.reactions[0].reactor, "u2");
        assert_eq!(message.reactions[0].kind, ReactionKind::Love);

        // The sender saw both deltas.
        let deltas: Vec<_> = alice
            .drain()
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ReactionAdded { .. }))
            .collect();
        assert_eq!(deltas.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let (engine, store) = engine();
        let mut alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        let id = engine
            .send_message(&alice.conn_id, private_request("read me", "u2"))
            .await
            .unwrap();
        alice.drain();
        bob.drain();

        engine.mark_read(&bob.conn_id, id).await.unwrap();
        engine.mark_read(&bob.conn_id, id).await.unwrap();

        let message = store.message_by_id(id).await.unwrap().unwrap();
        // Sender seed plus exactly one receipt for bob.
        assert_eq!(message.read_by.len(), 2);

        let read_events: Vec<_> = alice
            .drain()
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageRead { .. }))
            .collect();
        assert_eq!(read_events.len(), 1);
    }

    #[tokio::test]
    async fn test_reaction_on_unknown_message() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;

        let result = engine.add_reaction(&alice.conn_id, 424_242, ReactionKind::Sad).await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_foreign_private_message_is_scope_violation() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;
        let eve = connect(&engine, "u3", "Eve").await;

        let id = engine
            .send_message(&alice.conn_id, private_request("secret", "u2"))
            .await
            .unwrap();

        assert!(matches!(
            engine.mark_read(&eve.conn_id, id).await,
            Err(CoreError::ScopeViolation)
        ));
        assert!(matches!(
            engine.add_reaction(&eve.conn_id, id, ReactionKind::Angry).await,
            Err(CoreError::ScopeViolation)
        ));
    }

    #[tokio::test]
    async fn test_offline_broadcast_exactly_once() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;
        let mut carol = connect(&engine, "u3", "Carol").await;
        bob.drain();
        carol.drain();

        engine.disconnect(&alice.conn_id).await;

        assert!(!engine.presence().is_online("u1"));
        assert!(engine.presence().snapshot().iter().all(|p| p.user.id != "u1"));

        for client in [&mut bob, &mut carol] {
            let offline: Vec<_> = client
                .drain()
                .into_iter()
                .filter(|e| matches!(
                    e,
                    ServerEvent::IdentityOffline { user } if user.user.id == "u1"
                ))
                .collect();
            assert_eq!(offline.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_double_stop_typing_single_broadcast() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        engine.join_room(&alice.conn_id, "general").await.unwrap();
        engine.join_room(&bob.conn_id, "general").await.unwrap();
        bob.drain();

        let target = Target::Room("general".into());
        engine.start_typing(&alice.conn_id, &target).unwrap();
        engine.stop_typing(&alice.conn_id, &target).unwrap();
        engine.stop_typing(&alice.conn_id, &target).unwrap();

        let events = bob.drain();
        let stopped = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::UserStoppedTyping { .. }))
            .count();
        assert_eq!(stopped, 1);
        assert!(events.iter().any(|e| matches!(e, ServerEvent::UserTyping { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_clears_typing() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        engine.join_room(&alice.conn_id, "general").await.unwrap();
        engine.join_room(&bob.conn_id, "general").await.unwrap();
        engine.start_typing(&alice.conn_id, &Target::Room("general".into())).unwrap();
        bob.drain();

        engine.disconnect(&alice.conn_id).await;

        assert!(bob
            .drain()
            .iter()
            .any(|e| matches!(e, ServerEvent::UserStoppedTyping { user, .. } if user.id == "u1")));
    }

    #[tokio::test]
    async fn test_join_delivers_snapshot_and_history() {
        let (engine, _store) = engine();
        let mut alice = connect(&engine, "u1", "Alice").await;
        let _bob = connect(&engine, "u2", "Bob").await;
        alice.drain();

        engine.join_room(&alice.conn_id, "general").await.unwrap();
        engine
            .send_message(&alice.conn_id, room_request("first", "general"))
            .await
            .unwrap();
        alice.drain();

        // A later joiner should see the earlier message as history.
        let mut carol = connect(&engine, "u3", "Carol").await;
        engine.join_room(&carol.conn_id, "general").await.unwrap();

        let events = carol.drain();
        let snapshot = events.iter().find_map(|e| match e {
            ServerEvent::PresenceSnapshot { users } => Some(users),
            _ => None,
        });
        assert_eq!(snapshot.expect("snapshot expected").len(), 3);

        let history = events.into_iter().find_map(|e| match e {
            ServerEvent::RoomHistory { messages, .. } => Some(messages),
            _ => None,
        });
        let history = history.expect("history expected");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "first");
    }

    #[tokio::test]
    async fn test_join_new_room_leaves_previous() {
        let (engine, _store) = engine();
        let alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        engine.join_room(&alice.conn_id, "general").await.unwrap();
        engine.join_room(&bob.conn_id, "general").await.unwrap();
        bob.drain();

        engine.join_room(&alice.conn_id, "random").await.unwrap();

        assert!(bob
            .drain()
            .iter()
            .any(|e| matches!(
                e,
                ServerEvent::RoomLeft { user, room } if user.id == "u1" && room == "general"
            )));

        // Alice no longer receives general traffic.
        engine
            .send_message(&bob.conn_id, room_request("still here?", "general"))
            .await
            .unwrap();
        let mut alice = alice;
        assert!(!alice
            .drain()
            .iter()
            .any(|e| matches!(e, ServerEvent::NewMessage { .. })));
    }

    /// Store that fails every write, for abort-path coverage.
    struct FailingStore;

    #[async_trait]
    impl StoreAdapter for FailingStore {
        async fn create_message(&self, _message: Message) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("write failed".into()))
        }
        async fn message_by_id(&self, _id: MessageId) -> Result<Option<Message>, StoreError> {
            Err(StoreError::Unavailable("read failed".into()))
        }
        async fn messages_by_room(
            &self,
            _room: &str,
            _filter: HistoryFilter,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Unavailable("read failed".into()))
        }
        async fn messages_by_pair(
            &self,
            _a: &str,
            _b: &str,
            _filter: HistoryFilter,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Unavailable("read failed".into()))
        }
        async fn update_read_by(
            &self,
            _id: MessageId,
            _receipt: ReadReceipt,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("write failed".into()))
        }
        async fn update_reactions(
            &self,
            _id: MessageId,
            _reaction: Reaction,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("write failed".into()))
        }
        async fn user_by_id(&self, _id: &str) -> Result<Option<crate::store::UserRecord>, StoreError> {
            Ok(None)
        }
        async fn update_user_status(
            &self,
            _identity: &Identity,
            _status: UserStatus,
            _last_seen: u64,
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persist_failure_aborts_fan_out() {
        let engine = Engine::new(Arc::new(FailingStore));
        let mut alice = connect(&engine, "u1", "Alice").await;
        let mut bob = connect(&engine, "u2", "Bob").await;

        engine.join_room(&alice.conn_id, "general").await.ok();
        engine.join_room(&bob.conn_id, "general").await.ok();
        alice.drain();
        bob.drain();

        let result = engine
            .send_message(&alice.conn_id, room_request("doomed", "general"))
            .await;
        assert!(matches!(result, Err(CoreError::Store(_))));

        // No partial fan-out, no ack.
        assert!(bob.drain().is_empty());
        assert!(alice.drain().is_empty());
    }
}
