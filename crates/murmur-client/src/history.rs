//! Backward pagination of a conversation's history.

use std::time::Duration;

use tracing::{debug, info};

use murmur_shared::types::ConversationId;

use crate::error::Result;
use crate::store::{lock, LoadGuard};
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page arrived; this many unseen messages were prepended.
    Loaded(usize),
    /// History is exhausted; nothing was requested.
    Exhausted,
    /// A page request is already running.
    InFlight,
    /// Too soon after the initial load.
    TooSoon,
    /// The initial page has not been loaded yet.
    NotReady,
    /// The viewport is not close enough to the top.
    NotNeeded,
}

#[derive(Clone)]
pub struct HistoryLoader {
    engine: SyncEngine,
    debounce: Duration,
    prefetch_threshold: usize,
}

impl HistoryLoader {
    pub fn new(engine: SyncEngine, debounce: Duration, prefetch_threshold: usize) -> Self {
        Self {
            engine,
            debounce,
            prefetch_threshold,
        }
    }

    /// Called by the view with the index of the first visible message.
    pub async fn on_viewport(&self, conversation: ConversationId, first_visible_index: usize) -> Result<LoadOutcome> {
        if first_visible_index > self.prefetch_threshold {
            return Ok(LoadOutcome::NotNeeded);
        }
        self.load_more(conversation).await
    }

    /// Request the next older page. An empty page marks the history exhausted
    /// for good.
    pub async fn load_more(&self, conversation: ConversationId) -> Result<LoadOutcome> {
        let start_index = {
            let store = lock(self.engine.store());
            let conv = store.conversation(conversation)?;
            if !conv.messages_loaded {
                return Ok(LoadOutcome::NotReady);
            }
            if conv.history_exhausted {
                return Ok(LoadOutcome::Exhausted);
            }
            if conv.loaded_at.is_some_and(|at| at.elapsed() < self.debounce) {
                return Ok(LoadOutcome::TooSoon);
            }
            conv.pagination_cursor
        };

        let Some(_guard) = LoadGuard::acquire(self.engine.store(), conversation)? else {
            return Ok(LoadOutcome::InFlight);
        };

        debug!(conversation = %conversation, start_index, "Loading older messages");
        let page = self.engine.fetch_page(conversation, Some(start_index)).await?;

        let mut store = lock(self.engine.store());
        let conv = store.conversation_mut(conversation)?;
        conv.pagination_cursor = start_index + self.engine.page_size();
        if page.is_empty() {
            conv.history_exhausted = true;
            info!(conversation = %conversation, "History exhausted");
            return Ok(LoadOutcome::Exhausted);
        }

        let received = page.len();
        let inserted = store.prepend_page(conversation, page)?;
        debug!(conversation = %conversation, received, inserted, "Prepended older messages");
        Ok(LoadOutcome::Loaded(inserted))
    }
}
