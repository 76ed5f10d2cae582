//! Presence tracking.
//!
//! The registry maps each online identity to its live connection handle.
//! One entry per identity: a reconnection with the same identity overwrites
//! the previous entry rather than duplicating it. Live status is distinct
//! from the persisted last-known status, which the engine writes through the
//! store on transitions.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use banter_protocol::events::ServerEvent;
use banter_protocol::model::{Identity, PresenceInfo, UserId, UserStatus};

/// Connection identifier assigned by the gateway.
pub type ConnectionId = String;

/// Per-connection channel the gateway drains towards the client. This is
/// the only path outbound events travel.
pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

/// Handle to one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Gateway-assigned connection id.
    pub conn_id: ConnectionId,
    /// Outbound event channel.
    pub sender: OutboundSender,
}

impl ConnectionHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new(conn_id: impl Into<ConnectionId>, sender: OutboundSender) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
        }
    }

    /// Push an event towards the client. A closed channel means the
    /// connection is already gone; that is not an error here.
    pub fn push(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

/// Presence entry for a single online identity.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// Who.
    pub identity: Identity,
    /// The live connection.
    pub handle: ConnectionHandle,
    /// Current live status.
    pub status: UserStatus,
    /// Last activity (unix milliseconds).
    pub last_seen: u64,
}

impl PresenceEntry {
    /// Snapshot view of this entry.
    #[must_use]
    pub fn info(&self) -> PresenceInfo {
        PresenceInfo {
            user: self.identity.clone(),
            status: self.status,
            last_seen: self.last_seen,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Registry of currently-online identities.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<UserId, PresenceEntry>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of online identities.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Check if an identity is online.
    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.entries.contains_key(user)
    }

    /// Mark an identity online.
    ///
    /// Returns the previous entry if the identity was already connected
    /// (reconnection overwrites).
    pub fn register(&self, identity: Identity, handle: ConnectionHandle) -> Option<PresenceEntry> {
        let entry = PresenceEntry {
            identity: identity.clone(),
            handle,
            status: UserStatus::Online,
            last_seen: now_ms(),
        };
        let previous = self.entries.insert(identity.id.clone(), entry);
        if previous.is_some() {
            debug!(user = %identity.id, "Presence: reconnected, entry overwritten");
        } else {
            debug!(user = %identity.id, "Presence: online");
        }
        previous
    }

    /// Remove an identity, but only if the given connection still owns the
    /// entry. A stale disconnect arriving after a reconnection must not tear
    /// down the new connection's entry.
    ///
    /// Returns the removed entry with `last_seen` set to now.
    pub fn unregister(&self, user: &str, conn_id: &str) -> Option<PresenceEntry> {
        let removed = self
            .entries
            .remove_if(user, |_, entry| entry.handle.conn_id == conn_id);
        removed.map(|(_, mut entry)| {
            entry.status = UserStatus::Offline;
            entry.last_seen = now_ms();
            debug!(user = %user, "Presence: offline");
            entry
        })
    }

    /// Current entry for an identity.
    #[must_use]
    pub fn lookup(&self, user: &str) -> Option<PresenceEntry> {
        self.entries.get(user).map(|e| e.clone())
    }

    /// Full current online set, used to answer a newly-joined connection's
    /// presence query.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceInfo> {
        self.entries.iter().map(|e| e.info()).collect()
    }

    /// Push an event to every online identity except the subject.
    pub fn broadcast_except(&self, subject: &str, event: &ServerEvent) {
        for entry in self.entries.iter() {
            if entry.key() != subject {
                entry.handle.push(event.clone());
            }
        }
    }

    /// Push an event to a single identity's live connection.
    ///
    /// Returns `true` if the identity was online.
    pub fn push_to(&self, user: &str, event: ServerEvent) -> bool {
        match self.entries.get(user) {
            Some(entry) => {
                entry.handle.push(event);
                true
            }
            None => false,
        }
    }
}
