//! Typing activity tracking.
//!
//! Maps each conversation scope to the set of identities currently typing
//! in it. Ephemeral process-local state: never persisted, lost on restart by
//! design. Both start and stop are idempotent; the boolean returns let the
//! caller suppress duplicate broadcasts.

use std::collections::HashSet;

use dashmap::DashMap;
use tracing::debug;

use crate::scope::Scope;
use banter_protocol::model::UserId;

/// Per-scope typing state.
#[derive(Debug, Default)]
pub struct TypingTracker {
    scopes: DashMap<Scope, HashSet<UserId>>,
}

impl TypingTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a user as typing in a scope.
    ///
    /// Returns `true` if the user was not already typing there.
    pub fn start(&self, user: &str, scope: &Scope) -> bool {
        let newly = self
            .scopes
            .entry(scope.clone())
            .or_default()
            .insert(user.to_string());
        if newly {
            debug!(user = %user, ?scope, "Typing: started");
        }
        newly
    }

    /// Mark a user as no longer typing in a scope.
    ///
    /// Returns `true` if the user was actually typing there; stopping when
    /// absent is a no-op.
    pub fn stop(&self, user: &str, scope: &Scope) -> bool {
        let removed = match self.scopes.get_mut(scope) {
            Some(mut set) => set.remove(user),
            None => false,
        };
        if removed {
            debug!(user = %user, ?scope, "Typing: stopped");
            self.scopes.remove_if(scope, |_, set| set.is_empty());
        }
        removed
    }

    /// Remove a user from every scope (disconnect path).
    ///
    /// Returns the scopes the user was typing in, so a stop event can be
    /// broadcast for each.
    pub fn clear_user(&self, user: &str) -> Vec<Scope> {
        let mut cleared = Vec::new();
        for mut entry in self.scopes.iter_mut() {
            if entry.value_mut().remove(user) {
                cleared.push(entry.key().clone());
            }
        }
        for scope in &cleared {
            self.scopes.remove_if(scope, |_, set| set.is_empty());
        }
        if !cleared.is_empty() {
            debug!(user = %user, scopes = cleared.len(), "Typing: cleared on disconnect");
        }
        cleared
    }

    /// Identities currently typing in a scope.
    #[must_use]
    pub fn typists(&self, scope: &Scope) -> Vec<UserId> {
        self.scopes
            .get(scope)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::PairKey;

    fn room() -> Scope {
        Scope::Room("general".into())
    }

    #[test]
    fn test_start_stop() {
        let typing = TypingTracker::new();

        assert!(typing.start("u1", &room()));
        assert_eq!(typing.typists(&room()), vec!["u1".to_string()]);

        assert!(typing.stop("u1", &room()));
        assert!(typing.typists(&room()).is_empty());
    }

    #[test]
    fn test_start_twice_is_idempotent() {
        let typing = TypingTracker::new();

        assert!(typing.start("u1", &room()));
        assert!(!typing.start("u1", &room()));
        assert_eq!(typing.typists(&room()).len(), 1);
    }

    #[test]
    fn test_stop_when_absent_is_noop() {
        let typing = TypingTracker::new();

        typing.start("u1", &room());
        assert!(typing.stop("u1", &room()));
        assert!(!typing.stop("u1", &room()));
    }

    #[test]
    fn test_clear_user_spans_scopes() {
        let typing = TypingTracker::new();
        let direct = Scope::Direct(PairKey::new("u1", "u2"));

        typing.start("u1", &room());
        typing.start("u1", &direct);
        typing.start("u2", &room());

        let mut cleared = typing.clear_user("u1");
        cleared.sort_by_key(|s| format!("{s:?}"));
        assert_eq!(cleared.len(), 2);
        assert_eq!(typing.typists(&room()), vec!["u2".to_string()]);
        assert!(typing.typists(&direct).is_empty());

        assert!(typing.clear_user("u1").is_empty());
    }
}
