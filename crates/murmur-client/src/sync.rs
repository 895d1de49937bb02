//! Synchronization engine: outbound sends, ack reconciliation, inbound new
//! messages and the initial history load.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_net::TransportClient;
use murmur_shared::crypto::{CryptoAdapter, Keyword};
use murmur_shared::protocol::{
    ClientRequest, ContentEnvelope, FileDescriptor, NewMessageEvent, SendAck, ServerEvent,
};
use murmur_shared::types::{ConversationId, TempId, UserId};

use crate::decrypt::decrypt_batch;
use crate::error::{ClientError, Result};
use crate::model::{Content, LastMessage, Message, MessageKey, MessageStatus};
use crate::reconcile::{apply_ack, Transition};
use crate::store::{lock, LoadGuard, SharedStore};
use crate::temp_id::generate_temp_id;

#[derive(Clone)]
pub struct SyncEngine {
    store: SharedStore,
    transport: TransportClient,
    crypto: Arc<dyn CryptoAdapter>,
    self_id: UserId,
    page_size: u32,
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        transport: TransportClient,
        crypto: Arc<dyn CryptoAdapter>,
        self_id: UserId,
        page_size: u32,
    ) -> Self {
        Self {
            store,
            transport,
            crypto,
            self_id,
            page_size,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn transport(&self) -> &TransportClient {
        &self.transport
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoAdapter> {
        &self.crypto
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Generate a temp id and insert the optimistic message under one lock so
    /// no other send can pick the same id in between.
    pub fn insert_pending(&self, conversation: ConversationId, content: Content) -> Result<(TempId, Keyword)> {
        self.insert_pending_with(conversation, content, None)
    }

    pub fn insert_pending_with(
        &self,
        conversation: ConversationId,
        content: Content,
        upload_progress: Option<u8>,
    ) -> Result<(TempId, Keyword)> {
        let mut store = lock(&self.store);
        let keyword = store.keyword(conversation)?;
        let temp_id = generate_temp_id(&mut rand::thread_rng(), |t| store.is_temp_id_taken(t));
        let mut message = Message::pending(temp_id, self.self_id, content);
        message.upload_progress = upload_progress;
        store.insert_pending(conversation, message)?;
        Ok((temp_id, keyword))
    }

    pub async fn send_text(&self, conversation: ConversationId, text: String) -> Result<TempId> {
        let envelope = ContentEnvelope::text(text.clone());
        let (temp_id, keyword) = self.insert_pending(conversation, Content::Text { text })?;
        debug!(conversation = %conversation, temp_id = %temp_id, "Sending text message");

        self.post_envelope(conversation, temp_id, &envelope, &keyword, None)
            .await?;
        Ok(temp_id)
    }

    /// Encrypt `envelope` and post it as `send_message`. On failure the
    /// pending message is marked failed before the error is returned.
    pub async fn post_envelope(
        &self,
        conversation: ConversationId,
        temp_id: TempId,
        envelope: &ContentEnvelope,
        keyword: &Keyword,
        files: Option<Vec<FileDescriptor>>,
    ) -> Result<()> {
        let result = async {
            let plaintext = envelope.to_json()?;
            let text = self.crypto.encrypt(plaintext.as_bytes(), keyword)?;
            self.transport
                .post(&ClientRequest::SendMessage {
                    temp_id,
                    conversation,
                    text,
                    files,
                })
                .await?;
            Ok::<_, ClientError>(())
        }
        .await;

        if let Err(e) = &result {
            warn!(conversation = %conversation, temp_id = %temp_id, error = %e, "Send failed");
            self.fail_pending(temp_id);
        }
        result
    }

    /// Mark a still-pending message failed and drop it from the in-flight set.
    pub fn fail_pending(&self, temp_id: TempId) -> bool {
        let mut store = lock(&self.store);
        store.release(temp_id);
        match store.message_by_temp_mut(temp_id) {
            Some((_, message)) if message.is_pending() => {
                message.status = MessageStatus::Failed;
                message.upload_progress = None;
                true
            }
            _ => false,
        }
    }

    /// Route a `send_message` ack to its message. Returns `None` when no
    /// message carries that temp id.
    pub fn handle_ack(&self, ack: &SendAck) -> Option<(ConversationId, Transition)> {
        let mut store = lock(&self.store);
        let Some((conversation, message)) = store.message_by_temp_mut(ack.temp_id) else {
            debug!(temp_id = %ack.temp_id, status = ?ack.status, "Ack for unknown temp id");
            return None;
        };

        let transition = apply_ack(message, ack);
        match transition {
            Transition::Confirmed(id) => {
                info!(conversation = %conversation, temp_id = %ack.temp_id, id = %id, "Message confirmed");
            }
            Transition::Failed => {
                warn!(conversation = %conversation, temp_id = %ack.temp_id, id = ?ack.id, "Server rejected message");
            }
            Transition::AwaitingUpload | Transition::Unchanged => {}
        }
        if let Transition::Confirmed(id) = transition {
            let dropped = store.collapse_echoes(conversation, id, ack.temp_id);
            if dropped > 0 {
                debug!(conversation = %conversation, id = %id, dropped, "Dropped echo received before ack");
            }
        }
        if transition.is_terminal() {
            store.release(ack.temp_id);
        }
        Some((conversation, transition))
    }

    /// Apply a `new_message` event. Only the active conversation's log grows;
    /// others get a summary refresh and an unread bump.
    pub async fn handle_new_message(&self, event: NewMessageEvent) -> Result<()> {
        let conversation = event.conversation;
        let keyword = match lock(&self.store).keyword(conversation) {
            Ok(keyword) => keyword,
            Err(_) => {
                debug!(conversation = %conversation, "New message for unknown conversation");
                return Ok(());
            }
        };

        let mut decrypted = decrypt_batch(Arc::clone(&self.crypto), keyword, vec![event.into()]).await;
        let Some(message) = decrypted.pop() else {
            return Ok(());
        };

        let mut store = lock(&self.store);
        if store.active() == Some(conversation) {
            if !store.append(conversation, message)? {
                debug!(conversation = %conversation, "Duplicate new message ignored");
            }
            return Ok(());
        }

        let own = message.author_id == self.self_id;
        let conv = store.conversation_mut(conversation)?;
        conv.last_message = Some(LastMessage::of(&message));
        if !own {
            conv.unread += 1;
        }
        Ok(())
    }

    /// Fetch and decrypt one page of history.
    pub async fn fetch_page(&self, conversation: ConversationId, start_index: Option<u32>) -> Result<Vec<Message>> {
        let keyword = lock(&self.store).keyword(conversation)?;
        let request = ClientRequest::LoadMessages {
            request_id: Uuid::new_v4(),
            conversation,
            start_index,
        };

        match self.transport.send(request).await? {
            ServerEvent::Messages(page) => {
                debug!(
                    conversation = %conversation,
                    start_index = ?start_index,
                    count = page.messages.len(),
                    "Received history page"
                );
                Ok(decrypt_batch(Arc::clone(&self.crypto), keyword, page.messages).await)
            }
            other => Err(ClientError::UnexpectedResponse(other.name())),
        }
    }

    /// Load the newest page once per conversation. An empty page still marks
    /// the conversation as loaded. Returns the number of messages inserted.
    pub async fn load_initial(&self, conversation: ConversationId) -> Result<usize> {
        if lock(&self.store).conversation(conversation)?.messages_loaded {
            return Ok(0);
        }
        let Some(_guard) = LoadGuard::acquire(&self.store, conversation)? else {
            debug!(conversation = %conversation, "Initial load already in flight");
            return Ok(0);
        };

        let messages = self.fetch_page(conversation, None).await?;
        let received = messages.len();

        let mut store = lock(&self.store);
        let conv = store.conversation_mut(conversation)?;
        conv.messages_loaded = true;
        conv.pagination_cursor = self.page_size;
        conv.history_exhausted = received == 0;
        conv.loaded_at = Some(Instant::now());
        let inserted = store.prepend_page(conversation, messages)?;

        info!(conversation = %conversation, received, inserted, "Initial history loaded");
        Ok(inserted)
    }

    /// Re-send a failed text message in place under a fresh temp id.
    pub async fn retry(&self, conversation: ConversationId, temp_id: TempId) -> Result<TempId> {
        let (fresh, text, keyword) = {
            let mut store = lock(&self.store);
            let conv = store.conversation(conversation)?;
            let text = conv
                .position(MessageKey::Temp(temp_id))
                .and_then(|i| match &conv.messages[i].payload {
                    Some(Content::Text { text }) => Some(text.clone()),
                    _ => None,
                })
                .ok_or(ClientError::NotRetryable(temp_id))?;
            let keyword = conv.keyword.clone();

            let fresh = generate_temp_id(&mut rand::thread_rng(), |t| store.is_temp_id_taken(t));
            store.rearm(conversation, temp_id, fresh)?;
            (fresh, text, keyword)
        };

        info!(conversation = %conversation, old = %temp_id, temp_id = %fresh, "Retrying message");
        self.post_envelope(conversation, fresh, &ContentEnvelope::text(text), &keyword, None)
            .await?;
        Ok(fresh)
    }

    /// Channel loss: everything still in flight has failed.
    pub fn handle_disconnect(&self) -> Vec<(ConversationId, TempId)> {
        let failed = lock(&self.store).fail_all_in_flight();
        if !failed.is_empty() {
            warn!(count = failed.len(), "Marked in-flight messages failed after disconnect");
        }
        failed
    }
}
