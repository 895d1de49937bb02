//! The facade the UI talks to.
//!
//! [`Messenger::start`] wires the transport, the synchronization engine, the
//! transfer manager and the history loader together, and spawns the single
//! dispatcher task that applies inbound events in arrival order.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_net::{DuplexLink, InboundEvent, SubscriptionId, TransportClient, EVENT_DISCONNECTED};
use murmur_shared::crypto::{CryptoAdapter, Keyword};
use murmur_shared::protocol::{ServerEvent, EVENT_DOWNLOAD_FILE, EVENT_NEW_MESSAGE, EVENT_SEND_ACK};
use murmur_shared::types::{ConversationId, ConversationKind, MessageId, TempId, UserId};
use murmur_store::BlobCache;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::history::{HistoryLoader, LoadOutcome};
use crate::model::ConversationSnapshot;
use crate::store::{lock, MessageStore};
use crate::sync::SyncEngine;
use crate::transfer::{DownloadStart, LocalFile, TransferEvent, TransferManager};

pub struct Messenger {
    engine: SyncEngine,
    transfers: TransferManager,
    history: HistoryLoader,
    subscriptions: Vec<SubscriptionId>,
    dispatcher: JoinHandle<()>,
}

impl Messenger {
    /// Must be called from within a tokio runtime.
    pub fn start(
        link: DuplexLink,
        config: &ClientConfig,
        crypto: Arc<dyn CryptoAdapter>,
        cache: Arc<dyn BlobCache>,
    ) -> Self {
        let transport = TransportClient::start(link, config.transport());
        let engine = SyncEngine::new(
            MessageStore::shared(),
            transport.clone(),
            crypto,
            UserId(config.user_id),
            config.page_size,
        );
        let transfers = TransferManager::new(engine.clone(), cache, config.max_file_size);
        let history = HistoryLoader::new(
            engine.clone(),
            config.history_debounce,
            config.prefetch_threshold,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = [EVENT_SEND_ACK, EVENT_NEW_MESSAGE, EVENT_DOWNLOAD_FILE, EVENT_DISCONNECTED]
            .into_iter()
            .map(|name| {
                let tx = tx.clone();
                transport.subscribe(name, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        let dispatcher = tokio::spawn(dispatch_loop(rx, engine.clone(), transfers.clone()));

        info!(user = config.user_id, "Messenger started");
        Self {
            engine,
            transfers,
            history,
            subscriptions,
            dispatcher,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.engine.transport().is_connected()
    }

    pub fn add_conversation(&self, id: ConversationId, kind: ConversationKind, keyword: Keyword) -> bool {
        lock(self.engine.store()).add_conversation(id, kind, keyword)
    }

    /// Make `id` the active conversation and load its newest page if that has
    /// not happened yet.
    pub async fn open_conversation(&self, id: ConversationId) -> Result<usize> {
        lock(self.engine.store()).set_active(id)?;
        self.engine.load_initial(id).await
    }

    pub async fn send_text(&self, conversation: ConversationId, text: impl Into<String>) -> Result<TempId> {
        self.engine.send_text(conversation, text.into()).await
    }

    pub async fn send_files(
        &self,
        conversation: ConversationId,
        files: Vec<LocalFile>,
        caption: impl Into<String>,
    ) -> Result<Vec<TempId>> {
        self.transfers.send_files(conversation, files, caption.into()).await
    }

    pub async fn stop_upload(&self, temp_id: TempId) -> Result<bool> {
        self.transfers.stop_upload(temp_id).await
    }

    pub async fn request_download(&self, id: MessageId) -> Result<DownloadStart> {
        self.transfers.request_download(id).await
    }

    pub async fn load_more(&self, conversation: ConversationId) -> Result<LoadOutcome> {
        self.history.load_more(conversation).await
    }

    pub async fn on_viewport(&self, conversation: ConversationId, first_visible_index: usize) -> Result<LoadOutcome> {
        self.history.on_viewport(conversation, first_visible_index).await
    }

    pub async fn retry(&self, conversation: ConversationId, temp_id: TempId) -> Result<TempId> {
        self.engine.retry(conversation, temp_id).await
    }

    pub fn snapshot(&self, conversation: ConversationId) -> Result<ConversationSnapshot> {
        lock(self.engine.store()).snapshot(conversation)
    }

    pub fn conversations(&self) -> Vec<ConversationSnapshot> {
        lock(self.engine.store()).snapshots()
    }

    pub fn transfer_events(&self) -> broadcast::Receiver<TransferEvent> {
        self.transfers.subscribe()
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.active_count()
    }

    pub async fn close(&self) {
        self.engine.transport().close().await;
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.engine.transport().unsubscribe(id);
        }
        self.dispatcher.abort();
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    engine: SyncEngine,
    transfers: TransferManager,
) {
    while let Some(event) = rx.recv().await {
        match event {
            InboundEvent::Server(ServerEvent::SendMessage(ack)) => {
                if let Some((_, transition)) = engine.handle_ack(&ack) {
                    transfers.on_ack(&ack, transition);
                }
            }
            InboundEvent::Server(ServerEvent::NewMessage(message)) => {
                if let Err(e) = engine.handle_new_message(message).await {
                    warn!(error = %e, "Failed to apply new message");
                }
            }
            InboundEvent::Server(ServerEvent::DownloadFile(download)) => {
                transfers.on_download(download).await;
            }
            InboundEvent::Server(other) => {
                debug!(event = other.name(), "Ignoring uncorrelated event");
            }
            InboundEvent::Disconnected => {
                transfers.handle_disconnect();
                engine.handle_disconnect();
                break;
            }
        }
    }
    debug!("Dispatcher stopped");
}
