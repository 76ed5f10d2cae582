//! Room subscription tracking.
//!
//! Maps each room to its fan-out set of connections. Occupancy is
//! single-room per connection: joining a new room implicitly leaves the
//! previous one, and the left room is reported back so the caller can
//! broadcast a leave notice. Room existence is validated by the external
//! CRUD surface, not here; an unknown room id simply behaves as an
//! empty-membership room.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

use crate::presence::ConnectionId;
use banter_protocol::model::RoomId;

/// Connection-to-room subscription state.
#[derive(Debug, Default)]
pub struct RoomSubscriptions {
    /// Fan-out sets per room.
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    /// Current room per connection.
    by_conn: DashMap<ConnectionId, RoomId>,
}

impl RoomSubscriptions {
    /// Create an empty subscription table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room.
    ///
    /// Returns the room implicitly left, if the connection was subscribed
    /// elsewhere. Re-joining the current room is a no-op.
    pub fn join(&self, conn: &str, room: &str) -> Option<RoomId> {
        let previous = match self.by_conn.insert(conn.to_string(), room.to_string()) {
            Some(prev) if prev == room => return None,
            Some(prev) => {
                self.drop_member(&prev, conn);
                Some(prev)
            }
            None => None,
        };

        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn.to_string());
        debug!(connection = %conn, room = %room, "Room: subscribed");
        previous
    }

    /// Unsubscribe a connection from a room.
    ///
    /// Returns `true` if the connection was subscribed to it.
    pub fn leave(&self, conn: &str, room: &str) -> bool {
        let was_member = self
            .by_conn
            .remove_if(conn, |_, current| current == room)
            .is_some();
        if was_member {
            self.drop_member(room, conn);
            debug!(connection = %conn, room = %room, "Room: unsubscribed");
        }
        was_member
    }

    /// Remove a connection entirely (disconnect path).
    ///
    /// Returns the room it was subscribed to, if any.
    pub fn remove_connection(&self, conn: &str) -> Option<RoomId> {
        let (_, room) = self.by_conn.remove(conn)?;
        self.drop_member(&room, conn);
        debug!(connection = %conn, room = %room, "Room: connection removed");
        Some(room)
    }

    /// The room a connection is currently subscribed to.
    #[must_use]
    pub fn room_of(&self, conn: &str) -> Option<RoomId> {
        self.by_conn.get(conn).map(|r| r.clone())
    }

    /// The fan-out set of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscribers in a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|set| set.len()).unwrap_or(0)
    }

    /// Number of rooms with at least one subscriber.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn drop_member(&self, room: &str, conn: &str) {
        if let Some(mut set) = self.rooms.get_mut(room) {
            set.remove(conn);
            let empty = set.is_empty();
            drop(set); // Release the lock before removing the entry
            if empty {
                self.rooms.remove_if(room, |_, set| set.is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_leave() {
        let subs = RoomSubscriptions::new();

        assert!(subs.join("conn-1", "general").is_none());
        assert_eq!(subs.room_of("conn-1").as_deref(), Some("general"));
        assert_eq!(subs.members("general"), vec!["conn-1".to_string()]);

        assert!(subs.leave("conn-1", "general"));
        assert!(subs.room_of("conn-1").is_none());
        assert_eq!(subs.member_count("general"), 0);
    }

    #[test]
    fn test_join_implicitly_leaves_previous() {
        let subs = RoomSubscriptions::new();

        subs.join("conn-1", "general");
        let left = subs.join("conn-1", "random");

        assert_eq!(left.as_deref(), Some("general"));
        assert_eq!(subs.member_count("general"), 0);
        assert_eq!(subs.room_of("conn-1").as_deref(), Some("random"));
    }

    #[test]
    fn test_rejoin_same_room_is_noop() {
        let subs = RoomSubscriptions::new();

        subs.join("conn-1", "general");
        assert!(subs.join("conn-1", "general").is_none());
        assert_eq!(subs.member_count("general"), 1);
    }

    #[test]
    fn test_leave_room_not_joined() {
        let subs = RoomSubscriptions::new();
        subs.join("conn-1", "general");

        assert!(!subs.leave("conn-1", "random"));
        // Still subscribed to the original room.
        assert_eq!(subs.room_of("conn-1").as_deref(), Some("general"));
    }

    #[test]
    fn test_unknown_room_is_empty() {
        let subs = RoomSubscriptions::new();
        assert!(subs.members("nowhere").is_empty());
        assert_eq!(subs.member_count("nowhere"), 0);
    }

    #[test]
    fn test_remove_connection() {
        let subs = RoomSubscriptions::new();
        subs.join("conn-1", "general");
        subs.join("conn-2", "general");

        assert_eq!(subs.remove_connection("conn-1").as_deref(), Some("general"));
        assert_eq!(subs.members("general"), vec!["conn-2".to_string()]);
        assert!(subs.remove_connection("conn-1").is_none());
    }
}
