//! Conversation scopes.
//!
//! A scope is the boundary fan-out is limited to: a room, or the unordered
//! pair of identities in a private chat.

use banter_protocol::model::{RoomId, Target, UserId};

/// Canonical key for a private conversation. The pair is unordered: the key
/// is identical no matter which side derives it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    a: UserId,
    b: UserId,
}

impl PairKey {
    /// Build the canonical key for two users.
    #[must_use]
    pub fn new(x: impl Into<UserId>, y: impl Into<UserId>) -> Self {
        let (x, y) = (x.into(), y.into());
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    /// Check whether a user is one of the pair.
    #[must_use]
    pub fn involves(&self, user: &str) -> bool {
        self.a == user || self.b == user
    }

    /// The other member of the pair, if `user` is one of them.
    #[must_use]
    pub fn peer_of(&self, user: &str) -> Option<&UserId> {
        if self.a == user {
            Some(&self.b)
        } else if self.b == user {
            Some(&self.a)
        } else {
            None
        }
    }

    /// Both members.
    #[must_use]
    pub fn members(&self) -> (&UserId, &UserId) {
        (&self.a, &self.b)
    }
}

/// A conversation scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A shared room.
    Room(RoomId),
    /// A one-to-one conversation.
    Direct(PairKey),
}

impl Scope {
    /// Resolve a client-addressed target into a scope, anchored at the
    /// requesting user.
    #[must_use]
    pub fn resolve(requester: &str, target: &Target) -> Self {
        match target {
            Target::Room(room) => Scope::Room(room.clone()),
            Target::User(peer) => Scope::Direct(PairKey::new(requester, peer.clone())),
        }
    }

    /// The room id, for room scopes.
    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Scope::Room(room) => Some(room),
            Scope::Direct(_) => None,
        }
    }
}
