//! Paginated and searched history queries.
//!
//! Read-only views over the store, scoped strictly to a room or to a
//! private pair. A private-scope query must never leak a message whose
//! sender/recipient pair does not match the requester, so the requester is
//! checked against the pair before the store is consulted.

use std::sync::Arc;

use tracing::debug;

use crate::error::CoreError;
use crate::scope::Scope;
use crate::store::{HistoryFilter, StoreAdapter};
use banter_protocol::model::Message;

/// History query service.
pub struct HistoryService {
    store: Arc<dyn StoreAdapter>,
    search_limit: usize,
    page_size: usize,
}

impl HistoryService {
    /// Create a new service over a store.
    #[must_use]
    pub fn new(store: Arc<dyn StoreAdapter>, search_limit: usize, page_size: usize) -> Self {
        Self {
            store,
            search_limit,
            page_size,
        }
    }

    /// Case-insensitive substring search over a conversation, newest first.
    ///
    /// # Errors
    ///
    /// Returns `ScopeViolation` if the requester is not party to a private
    /// scope, or a store failure.
    pub async fn search(
        &self,
        requester: &str,
        scope: &Scope,
        query: &str,
    ) -> Result<Vec<Message>, CoreError> {
        let filter = HistoryFilter::page(self.search_limit).matching(query);
        let hits = self.query(requester, scope, filter).await?;
        debug!(requester = %requester, ?scope, hits = hits.len(), "History: search");
        Ok(hits)
    }

    /// A page of messages strictly older than the cursor.
    ///
    /// Queried newest-first, returned oldest-first for prepending to a
    /// client's in-memory timeline.
    ///
    /// # Errors
    ///
    /// Returns `ScopeViolation` if the requester is not party to a private
    /// scope, or a store failure.
    pub async fn load_older(
        &self,
        requester: &str,
        scope: &Scope,
        before: Option<u64>,
    ) -> Result<Vec<Message>, CoreError> {
        let filter = HistoryFilter::page(self.page_size).before(before);
        let mut page = self.query(requester, scope, filter).await?;
        page.reverse();
        debug!(requester = %requester, ?scope, count = page.len(), "History: load older");
        Ok(page)
    }

    async fn query(
        &self,
        requester: &str,
        scope: &Scope,
        filter: HistoryFilter,
    ) -> Result<Vec<Message>, CoreError> {
        match scope {
            Scope::Room(room) => Ok(self.store.messages_by_room(room, filter).await?),
            Scope::Direct(pair) => {
                if !pair.involves(requester) {
                    return Err(CoreError::ScopeViolation);
                }
                let (a, b) = pair.members();
                Ok(self.store.messages_by_pair(a, b, filter).await?)
            }
        }
    }
}
