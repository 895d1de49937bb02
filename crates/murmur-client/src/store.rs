//! Per-conversation message logs plus the index of in-flight temp ids.
//!
//! The store is shared as [`SharedStore`] between the synchronization engine,
//! the transfer manager and the history loader. Callers lock it for short,
//! synchronous sections and never hold the guard across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use murmur_shared::crypto::Keyword;
use murmur_shared::types::{ConversationId, ConversationKind, MessageId, TempId};

use crate::error::{ClientError, Result};
use crate::model::{Conversation, ConversationSnapshot, LastMessage, Message, MessageKey, MessageStatus};

pub type SharedStore = Arc<Mutex<MessageStore>>;

pub fn lock(store: &SharedStore) -> MutexGuard<'_, MessageStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationId, Conversation>,
    active: Option<ConversationId>,
    /// Pending messages awaiting a terminal ack. Acks carry only the temp id,
    /// so this is how they are routed to their conversation.
    in_flight: HashMap<TempId, ConversationId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register a conversation. Returns `false` (and keeps the existing state)
    /// when it is already known.
    pub fn add_conversation(&mut self, id: ConversationId, kind: ConversationKind, keyword: Keyword) -> bool {
        if self.conversations.contains_key(&id) {
            return false;
        }
        self.conversations.insert(id, Conversation::new(id, kind, keyword));
        true
    }

    pub fn conversation(&self, id: ConversationId) -> Result<&Conversation> {
        self.conversations
            .get(&id)
            .ok_or(ClientError::UnknownConversation(id))
    }

    pub fn conversation_mut(&mut self, id: ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(&id)
            .ok_or(ClientError::UnknownConversation(id))
    }

    pub fn set_active(&mut self, id: ConversationId) -> Result<()> {
        let conversation = self.conversation_mut(id)?;
        conversation.unread = 0;
        self.active = Some(id);
        Ok(())
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.active
    }

    pub fn keyword(&self, id: ConversationId) -> Result<Keyword> {
        Ok(self.conversation(id)?.keyword.clone())
    }

    /// A temp id is taken while it is in flight or still labels a message in
    /// any log (failed messages keep theirs until retried).
    pub fn is_temp_id_taken(&self, temp_id: TempId) -> bool {
        self.in_flight.contains_key(&temp_id)
            || self
                .conversations
                .values()
                .any(|c| c.contains(MessageKey::Temp(temp_id)))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, temp_id: TempId) -> bool {
        self.in_flight.contains_key(&temp_id)
    }

    /// Phase one of a send: append the optimistic message and index it.
    pub fn insert_pending(&mut self, conversation: ConversationId, message: Message) -> Result<()> {
        let temp_id = message.temp_id;
        let conv = self.conversation_mut(conversation)?;
        conv.last_message = Some(LastMessage::of(&message));
        conv.messages.push(message);
        if let Some(temp_id) = temp_id {
            self.in_flight.insert(temp_id, conversation);
        }
        Ok(())
    }

    /// Put an existing (failed) message back in flight under a fresh temp id.
    pub fn rearm(&mut self, conversation: ConversationId, old: TempId, fresh: TempId) -> Result<&Message> {
        let conv = self.conversation_mut(conversation)?;
        let message = conv
            .messages
            .iter_mut()
            .find(|m| m.matches(MessageKey::Temp(old)))
            .ok_or(ClientError::NotRetryable(old))?;
        if message.status != MessageStatus::Failed || message.id.is_some() {
            return Err(ClientError::NotRetryable(old));
        }
        message.temp_id = Some(fresh);
        message.status = MessageStatus::Pending;
        message.cancelled = false;
        self.in_flight.insert(fresh, conversation);

        let conv = self.conversation(conversation)?;
        conv.messages
            .iter()
            .find(|m| m.matches(MessageKey::Temp(fresh)))
            .ok_or(ClientError::NotRetryable(fresh))
    }

    pub fn conversation_of(&self, temp_id: TempId) -> Option<ConversationId> {
        self.in_flight.get(&temp_id).copied().or_else(|| {
            self.conversations
                .values()
                .find(|c| c.contains(MessageKey::Temp(temp_id)))
                .map(|c| c.id)
        })
    }

    /// The message labelled `temp_id`, whether or not it is still in flight.
    pub fn message_by_temp_mut(&mut self, temp_id: TempId) -> Option<(ConversationId, &mut Message)> {
        let conversation = self.conversation_of(temp_id)?;
        let conv = self.conversations.get_mut(&conversation)?;
        conv.messages
            .iter_mut()
            .find(|m| m.matches(MessageKey::Temp(temp_id)))
            .map(|m| (conversation, m))
    }

    /// Drop `temp_id` from the in-flight index.
    pub fn release(&mut self, temp_id: TempId) -> Option<ConversationId> {
        self.in_flight.remove(&temp_id)
    }

    /// Append a message unless one with the same key is already present.
    pub fn append(&mut self, conversation: ConversationId, message: Message) -> Result<bool> {
        let conv = self.conversation_mut(conversation)?;
        if message.key().is_some_and(|key| conv.contains(key)) {
            return Ok(false);
        }
        conv.last_message = Some(LastMessage::of(&message));
        conv.messages.push(message);
        Ok(true)
    }

    /// Drop entries that carry server id `id` but are not the message sent
    /// as `temp_id`. An echo of our own send can land before its ack.
    pub fn collapse_echoes(&mut self, conversation: ConversationId, id: MessageId, temp_id: TempId) -> usize {
        let Some(conv) = self.conversations.get_mut(&conversation) else {
            return 0;
        };
        let before = conv.messages.len();
        conv.messages
            .retain(|m| m.id != Some(id) || m.temp_id == Some(temp_id));
        before - conv.messages.len()
    }

    /// Prepend an older page, keeping its order and skipping entries already
    /// present (by id, then temp id). Returns the number inserted.
    pub fn prepend_page(&mut self, conversation: ConversationId, page: Vec<Message>) -> Result<usize> {
        let conv = self.conversation_mut(conversation)?;
        let mut fresh: Vec<Message> = Vec::with_capacity(page.len());
        for message in page {
            let duplicate = [message.id.map(MessageKey::Id), message.temp_id.map(MessageKey::Temp)]
                .into_iter()
                .flatten()
                .any(|key| conv.contains(key) || fresh.iter().any(|m| m.matches(key)));
            if !duplicate {
                fresh.push(message);
            }
        }

        let inserted = fresh.len();
        if inserted > 0 {
            if conv.last_message.is_none() {
                conv.last_message = fresh.last().map(LastMessage::of);
            }
            conv.messages.splice(0..0, fresh);
        }
        Ok(inserted)
    }

    pub fn find_by_id_mut(&mut self, conversation: ConversationId, id: MessageId) -> Option<&mut Message> {
        self.conversations
            .get_mut(&conversation)?
            .messages
            .iter_mut()
            .find(|m| m.id == Some(id))
    }

    /// Locate a confirmed message in any conversation.
    pub fn locate_id(&self, id: MessageId) -> Option<ConversationId> {
        self.conversations
            .values()
            .find(|c| c.contains(MessageKey::Id(id)))
            .map(|c| c.id)
    }

    /// Mark every in-flight message failed and clear the index.
    pub fn fail_all_in_flight(&mut self) -> Vec<(ConversationId, TempId)> {
        let drained: Vec<(TempId, ConversationId)> = self.in_flight.drain().collect();
        let mut failed = Vec::with_capacity(drained.len());
        for (temp_id, conversation) in drained {
            let Some(conv) = self.conversations.get_mut(&conversation) else {
                continue;
            };
            if let Some(message) = conv
                .messages
                .iter_mut()
                .find(|m| m.matches(MessageKey::Temp(temp_id)))
            {
                if message.is_pending() {
                    message.status = MessageStatus::Failed;
                    message.upload_progress = None;
                    failed.push((conversation, temp_id));
                }
            }
        }
        failed
    }

    pub fn snapshot(&self, id: ConversationId) -> Result<ConversationSnapshot> {
        Ok(self.conversation(id)?.snapshot())
    }

    pub fn snapshots(&self) -> Vec<ConversationSnapshot> {
        let mut all: Vec<_> = self.conversations.values().map(Conversation::snapshot).collect();
        all.sort_by_key(|s| s.id);
        all
    }
}

/// Marks a conversation as having a page request in flight; the flag clears
/// when the guard drops, on every exit path.
pub struct LoadGuard {
    store: SharedStore,
    conversation: ConversationId,
}

impl LoadGuard {
    /// `Ok(None)` when a load is already running for `conversation`.
    pub fn acquire(store: &SharedStore, conversation: ConversationId) -> Result<Option<Self>> {
        let mut guard = lock(store);
        let conv = guard.conversation_mut(conversation)?;
        if conv.loading {
            return Ok(None);
        }
        conv.loading = true;
        Ok(Some(Self {
            store: Arc::clone(store),
            conversation,
        }))
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Ok(conv) = lock(&self.store).conversation_mut(self.conversation) {
            conv.loading = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use murmur_shared::types::UserId;

    use super::*;
    use crate::model::Content;

    const CONV: ConversationId = ConversationId(1);

    fn store() -> MessageStore {
        let mut store = MessageStore::new();
        store.add_conversation(CONV, ConversationKind::Direct, Keyword::from_passphrase("k"));
        store
    }

    fn text(t: &str) -> Content {
        Content::Text { text: t.into() }
    }

    fn confirmed(id: i64) -> Message {
        Message::confirmed(MessageId(id), UserId(2), Some(text("x")), Utc::now())
    }

    #[test]
    fn test_add_conversation_is_idempotent() {
        let mut store = store();
        assert!(!store.add_conversation(CONV, ConversationKind::Group, Keyword::from_passphrase("other")));
        assert_eq!(store.conversation(CONV).unwrap().kind, ConversationKind::Direct);
    }

    #[test]
    fn test_insert_pending_indexes_temp_id() {
        let mut store = store();
        let temp = TempId(123456789);
        store
            .insert_pending(CONV, Message::pending(temp, UserId(1), text("hi")))
            .unwrap();

        assert!(store.is_in_flight(temp));
        assert!(store.is_temp_id_taken(temp));
        assert_eq!(store.conversation_of(temp), Some(CONV));
        assert_eq!(store.conversation(CONV).unwrap().last_message.as_ref().unwrap().summary, "hi");

        store.release(temp);
        assert!(!store.is_in_flight(temp));
        // still labels a message in the log
        assert!(store.is_temp_id_taken(temp));
    }

    #[test]
    fn test_unknown_conversation() {
        let mut store = store();
        let err = store
            .insert_pending(ConversationId(9), Message::pending(TempId(100000000), UserId(1), text("x")))
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownConversation(ConversationId(9))));
    }

    #[test]
    fn test_append_dedups_by_id() {
        let mut store = store();
        assert!(store.append(CONV, confirmed(5)).unwrap());
        assert!(!store.append(CONV, confirmed(5)).unwrap());
        assert_eq!(store.conversation(CONV).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_collapse_echoes_keeps_reconciled_entry() {
        let mut store = store();
        let temp = TempId(222333444);
        store
            .insert_pending(CONV, Message::pending(temp, UserId(1), text("hi")))
            .unwrap();
        store.append(CONV, confirmed(3)).unwrap();
        store.append(CONV, confirmed(42)).unwrap();
        store.message_by_temp_mut(temp).unwrap().1.id = Some(MessageId(42));

        assert_eq!(store.collapse_echoes(CONV, MessageId(42), temp), 1);
        let messages = &store.conversation(CONV).unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].temp_id, Some(temp));
        assert_eq!(messages[1].id, Some(MessageId(3)));
        assert_eq!(store.collapse_echoes(CONV, MessageId(42), temp), 0);
    }

    #[test]
    fn test_prepend_page_skips_pending_by_temp_id() {
        let mut store = store();
        let temp = TempId(555666777);
        store
            .insert_pending(CONV, Message::pending(temp, UserId(1), text("mine")))
            .unwrap();

        let mut echoed = confirmed(9);
        echoed.temp_id = Some(temp);
        let inserted = store.prepend_page(CONV, vec![confirmed(8), echoed]).unwrap();

        assert_eq!(inserted, 1);
        let messages = &store.conversation(CONV).unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, Some(MessageId(8)));
        assert_eq!(messages[1].temp_id, Some(temp));
        assert!(messages[1].is_pending());
    }

    #[test]
    fn test_prepend_page_keeps_order_and_skips_known() {
        let mut store = store();
        store.append(CONV, confirmed(10)).unwrap();

        let added = store
            .prepend_page(CONV, vec![confirmed(7), confirmed(8), confirmed(10), confirmed(8)])
            .unwrap();
        assert_eq!(added, 2);

        let ids: Vec<_> = store
            .conversation(CONV)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.unwrap().0)
            .collect();
        assert_eq!(ids, vec![7, 8, 10]);
    }

    #[test]
    fn test_fail_all_in_flight() {
        let mut store = store();
        let a = TempId(111111111);
        let b = TempId(222222222);
        store.insert_pending(CONV, Message::pending(a, UserId(1), text("a"))).unwrap();
        store.insert_pending(CONV, Message::pending(b, UserId(1), text("b"))).unwrap();

        let mut failed = store.fail_all_in_flight();
        failed.sort_by_key(|(_, t)| *t);
        assert_eq!(failed, vec![(CONV, a), (CONV, b)]);
        assert_eq!(store.in_flight_count(), 0);
        assert!(store
            .conversation(CONV)
            .unwrap()
            .messages
            .iter()
            .all(|m| m.status == MessageStatus::Failed));
    }

    #[test]
    fn test_rearm_only_failed_messages() {
        let mut store = store();
        let old = TempId(111111111);
        store.insert_pending(CONV, Message::pending(old, UserId(1), text("a"))).unwrap();
        assert!(matches!(
            store.rearm(CONV, old, TempId(333333333)),
            Err(ClientError::NotRetryable(_))
        ));

        store.fail_all_in_flight();
        let fresh = TempId(333333333);
        let message = store.rearm(CONV, old, fresh).unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.temp_id, Some(fresh));
        assert!(store.is_in_flight(fresh));
        assert_eq!(store.conversation(CONV).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_load_guard_clears_on_drop() {
        let shared = MessageStore::shared();
        lock(&shared).add_conversation(CONV, ConversationKind::Channel, Keyword::from_passphrase("k"));

        let guard = LoadGuard::acquire(&shared, CONV).unwrap();
        assert!(guard.is_some());
        assert!(LoadGuard::acquire(&shared, CONV).unwrap().is_none());

        drop(guard);
        assert!(!lock(&shared).conversation(CONV).unwrap().loading);
        assert!(LoadGuard::acquire(&shared, CONV).unwrap().is_some());
    }

    #[test]
    fn test_set_active_resets_unread() {
        let mut store = store();
        store.conversation_mut(CONV).unwrap().unread = 3;
        store.set_active(CONV).unwrap();
        assert_eq!(store.active(), Some(CONV));
        assert_eq!(store.conversation(CONV).unwrap().unread, 0);
    }
}
