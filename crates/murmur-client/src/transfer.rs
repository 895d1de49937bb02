//! File transfers: encrypted uploads driven by `send_message` acks, and
//! downloads that decrypt into the local cache.
//!
//! Every live transfer sits in one map keyed by [`TransferKey`]. A transfer is
//! removed as soon as it reaches a terminal state, so a late event for a
//! finished or cancelled transfer finds nothing to act on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use murmur_shared::constants::{PROGRESS_DONE, PROGRESS_QUEUED, PROGRESS_READ, PROGRESS_SENT};
use murmur_shared::crypto::{FileSecret, Keyword};
use murmur_shared::protocol::{
    ClientRequest, ContentEnvelope, ContentKind, DownloadEvent, DownloadStatus, FileDescriptor,
    FileMeta, SendAck, UploadFrame,
};
use murmur_shared::types::{ConversationId, MessageId, TempId};
use murmur_store::{BlobCache, CachedBlob};

use crate::error::{ClientError, Result};
use crate::model::{Attachment, Content, FileData, MessageStatus};
use crate::reconcile::Transition;
use crate::store::lock;
use crate::sync::SyncEngine;

const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── Transfer model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKey {
    Upload(TempId),
    Download(MessageId),
}

impl std::fmt::Display for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferKey::Upload(t) => write!(f, "upload:{t}"),
            TransferKey::Download(id) => write!(f, "download:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Message created, request not yet on the wire.
    Queued,
    /// Request sent; waiting for `awaiting_ack` (upload) or the file (download).
    AwaitingAck,
    /// File frame being read, encrypted and sent.
    Transmitting,
    Complete,
    Error,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Complete | TransferState::Error | TransferState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Queued, AwaitingAck) | (AwaitingAck, Transmitting) => true,
            (AwaitingAck | Transmitting, Complete) => true,
            (from, Error | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Cooperative cancellation flag shared between the manager and a transmit
/// task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A file picked for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub name: String,
    pub mime: String,
    pub size: u64,
    /// Thumbnail bytes supplied by the UI, shown while the upload runs.
    pub preview: Option<Bytes>,
}

impl LocalFile {
    /// Describe the file at `path`, guessing its type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            mime: guess_mime(&path).to_string(),
            name,
            size: metadata.len(),
            path,
            preview: None,
        })
    }

    pub fn with_preview(mut self, preview: impl Into<Bytes>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "json" => "application/json",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[derive(Debug)]
pub struct Transfer {
    pub key: TransferKey,
    pub conversation: ConversationId,
    pub source: Option<LocalFile>,
    secret: Option<FileSecret>,
    pub token: CancelToken,
    pub state: TransferState,
}

impl Transfer {
    fn advance(&mut self, next: TransferState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(key = %self.key, from = ?self.state, to = ?next, "Ignoring invalid transfer transition");
            return false;
        }
        self.state = next;
        true
    }
}

/// Observable transfer lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { key: TransferKey, percent: u8 },
    Completed { key: TransferKey },
    Failed { key: TransferKey, reason: String },
    Cancelled { key: TransferKey },
    DownloadFailed { id: MessageId, reason: String },
}

/// What `request_download` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStart {
    /// Served from the local cache without touching the network.
    Cached,
    Requested,
    AlreadyRunning,
}

// ── Manager ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

struct Inner {
    engine: SyncEngine,
    cache: Arc<dyn BlobCache>,
    transfers: Mutex<HashMap<TransferKey, Transfer>>,
    events: broadcast::Sender<TransferEvent>,
    max_file_size: u64,
}

impl TransferManager {
    pub fn new(engine: SyncEngine, cache: Arc<dyn BlobCache>, max_file_size: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                engine,
                cache,
                transfers: Mutex::new(HashMap::new()),
                events,
                max_file_size,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.transfers().len()
    }

    pub fn state_of(&self, key: TransferKey) -> Option<TransferState> {
        self.transfers().get(&key).map(|t| t.state)
    }

    fn transfers(&self) -> MutexGuard<'_, HashMap<TransferKey, Transfer>> {
        self.inner
            .transfers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransferEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    // ── Upload ──────────────────────────────────────────────────────────────

    /// Send `files` into `conversation`, one message per file. Only the first
    /// message carries `caption`. Returns the temp ids in input order.
    pub async fn send_files(
        &self,
        conversation: ConversationId,
        files: Vec<LocalFile>,
        caption: String,
    ) -> Result<Vec<TempId>> {
        let max = self.inner.max_file_size;
        if let Some(big) = files.iter().find(|f| f.size > max) {
            return Err(ClientError::FileTooLarge {
                name: big.name.clone(),
                size: big.size,
                max,
            });
        }

        let keyword = lock(self.inner.engine.store()).keyword(conversation)?;
        let mut temp_ids = Vec::with_capacity(files.len());
        let mut caption = Some(caption);

        for file in files {
            let text = caption.take().unwrap_or_default();
            temp_ids.push(self.queue_upload(conversation, file, text, &keyword).await?);
        }
        Ok(temp_ids)
    }

    /// Create the message and transfer for one file and post its metadata.
    /// A failed post leaves the message failed; only local errors abort.
    async fn queue_upload(
        &self,
        conversation: ConversationId,
        file: LocalFile,
        text: String,
        keyword: &Keyword,
    ) -> Result<TempId> {
        let engine = &self.inner.engine;
        let secret = engine.crypto().seal_file_secret(keyword)?;

        let data = match &file.preview {
            Some(bytes) => FileData::Inline(bytes.clone()),
            None => FileData::Local(file.path.clone()),
        };
        let attachment = Attachment {
            name: file.name.clone(),
            mime: file.mime.clone(),
            size: file.size,
            encrypted_key: secret.encrypted_key.clone(),
            encrypted_iv: secret.encrypted_iv.clone(),
            data: data.clone(),
        };
        let (kind, content) = if file.is_image() {
            (
                ContentKind::Image,
                Content::Image {
                    text: text.clone(),
                    preview: Some(data),
                    file: Some(attachment),
                },
            )
        } else {
            (
                ContentKind::File,
                Content::File {
                    text: text.clone(),
                    file: Some(attachment),
                },
            )
        };

        let (temp_id, _) = engine.insert_pending_with(conversation, content, Some(PROGRESS_QUEUED))?;
        let key = TransferKey::Upload(temp_id);

        let envelope = ContentEnvelope {
            kind,
            text: (!text.is_empty()).then_some(text),
            file: Some(FileMeta {
                name: file.name.clone(),
                mime: file.mime.clone(),
                size: file.size,
                encrypted_key: secret.encrypted_key.clone(),
                encrypted_iv: secret.encrypted_iv.clone(),
            }),
            preview: file
                .preview
                .as_ref()
                .filter(|_| file.is_image())
                .map(|bytes| STANDARD.encode(bytes)),
        };
        let descriptor = FileDescriptor {
            name: file.name.clone(),
            mime: file.mime.clone(),
            size: file.size,
        };

        self.transfers().insert(
            key,
            Transfer {
                key,
                conversation,
                source: Some(file),
                secret: Some(secret),
                token: CancelToken::new(),
                state: TransferState::Queued,
            },
        );
        self.emit(TransferEvent::Progress {
            key,
            percent: PROGRESS_QUEUED,
        });
        info!(conversation = %conversation, temp_id = %temp_id, "Upload queued");

        // the ack may be dispatched before the post returns
        if let Some(transfer) = self.transfers().get_mut(&key) {
            transfer.advance(TransferState::AwaitingAck);
        }
        if let Err(e) = engine
            .post_envelope(conversation, temp_id, &envelope, keyword, Some(vec![descriptor]))
            .await
        {
            self.fail(key, e.to_string());
        }
        Ok(temp_id)
    }

    /// Follow up on a reconciled `send_message` ack for an upload.
    pub fn on_ack(&self, ack: &SendAck, transition: Transition) {
        let key = TransferKey::Upload(ack.temp_id);
        match transition {
            Transition::AwaitingUpload => {
                let started = self
                    .transfers()
                    .get_mut(&key)
                    .is_some_and(|t| t.advance(TransferState::Transmitting));
                if started {
                    let manager = self.clone();
                    let temp_id = ack.temp_id;
                    tokio::spawn(async move { manager.transmit(key, temp_id).await });
                }
            }
            Transition::Confirmed(id) => {
                if let Some(mut transfer) = self.transfers().remove(&key) {
                    transfer.advance(TransferState::Complete);
                    info!(temp_id = %ack.temp_id, id = %id, "Upload complete");
                    self.emit(TransferEvent::Progress {
                        key,
                        percent: PROGRESS_DONE,
                    });
                    self.emit(TransferEvent::Completed { key });
                }
            }
            Transition::Failed => {
                if self.transfers().contains_key(&key) {
                    self.fail(key, "rejected by server".to_string());
                }
            }
            Transition::Unchanged => {}
        }
    }

    async fn transmit(&self, key: TransferKey, temp_id: TempId) {
        let parts = self
            .transfers()
            .get(&key)
            .and_then(|t| Some((t.source.clone()?, t.secret.clone()?, t.token.clone())));
        let Some((source, secret, token)) = parts else {
            return;
        };

        let bytes = match tokio::fs::read(&source.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(key, format!("read {}: {e}", source.path.display()));
                return;
            }
        };
        if token.is_cancelled() {
            return;
        }
        self.set_progress(key, PROGRESS_READ);

        let crypto = Arc::clone(self.inner.engine.crypto());
        let encrypted = tokio::task::spawn_blocking(move || crypto.encrypt_file(&bytes, &secret)).await;
        let binary = match encrypted {
            Ok(Ok(binary)) => binary,
            Ok(Err(e)) => {
                self.fail(key, e.to_string());
                return;
            }
            Err(e) => {
                self.fail(key, e.to_string());
                return;
            }
        };
        if token.is_cancelled() {
            return;
        }

        let frame = UploadFrame {
            temp_id,
            file_name: source.name,
            file_size: source.size,
            file_type: source.mime,
            binary,
        };
        let sent = match frame.to_bytes() {
            Ok(data) => self
                .inner
                .engine
                .transport()
                .send_binary(data)
                .await
                .map_err(ClientError::from),
            Err(e) => Err(ClientError::from(e)),
        };
        match sent {
            Ok(()) => {
                debug!(temp_id = %temp_id, "Upload frame sent");
                self.set_progress(key, PROGRESS_SENT);
            }
            Err(e) => self.fail(key, e.to_string()),
        }
    }

    /// Record progress on a live upload and its message.
    pub fn set_progress(&self, key: TransferKey, percent: u8) {
        if !self.transfers().contains_key(&key) {
            return;
        }
        if let TransferKey::Upload(temp_id) = key {
            let mut store = lock(self.inner.engine.store());
            if let Some((_, message)) = store.message_by_temp_mut(temp_id) {
                if message.is_pending() {
                    message.upload_progress = Some(percent);
                }
            }
        }
        self.emit(TransferEvent::Progress { key, percent });
    }

    /// Terminal failure: drop the transfer and fail its message.
    pub fn fail(&self, key: TransferKey, reason: String) {
        let Some(mut transfer) = self.transfers().remove(&key) else {
            return;
        };
        transfer.advance(TransferState::Error);
        transfer.token.cancel();
        warn!(key = %key, reason = %reason, "Transfer failed");

        match key {
            TransferKey::Upload(temp_id) => {
                self.inner.engine.fail_pending(temp_id);
                self.emit(TransferEvent::Failed { key, reason });
            }
            TransferKey::Download(id) => {
                self.emit(TransferEvent::DownloadFailed { id, reason });
            }
        }
    }

    /// Abort an upload. The message stays in the log as failed and cancelled.
    /// Returns `false` when no such upload is running.
    pub async fn stop_upload(&self, temp_id: TempId) -> Result<bool> {
        let key = TransferKey::Upload(temp_id);
        let removed = self.transfers().remove(&key);
        let Some(mut transfer) = removed else {
            return Ok(false);
        };
        transfer.token.cancel();
        transfer.advance(TransferState::Cancelled);

        {
            let mut store = lock(self.inner.engine.store());
            store.release(temp_id);
            if let Some((_, message)) = store.message_by_temp_mut(temp_id) {
                if message.is_pending() {
                    message.status = MessageStatus::Failed;
                    message.cancelled = true;
                    message.upload_progress = None;
                }
            }
        }
        self.emit(TransferEvent::Cancelled { key });
        info!(temp_id = %temp_id, "Upload cancelled");

        if let Err(e) = self
            .inner
            .engine
            .transport()
            .post(&ClientRequest::StopUpload { temp_id })
            .await
        {
            warn!(temp_id = %temp_id, error = %e, "Could not notify server of cancelled upload");
        }
        Ok(true)
    }

    /// Channel loss: every transfer is over.
    pub fn handle_disconnect(&self) {
        let drained: Vec<Transfer> = self.transfers().drain().map(|(_, t)| t).collect();
        for mut transfer in drained {
            transfer.token.cancel();
            transfer.advance(TransferState::Error);
            let reason = "disconnected".to_string();
            match transfer.key {
                TransferKey::Upload(_) => self.emit(TransferEvent::Failed {
                    key: transfer.key,
                    reason,
                }),
                TransferKey::Download(id) => self.emit(TransferEvent::DownloadFailed { id, reason }),
            }
        }
    }

    // ── Download ────────────────────────────────────────────────────────────

    /// Fetch the file attached to message `id`, from the local cache when
    /// possible.
    pub async fn request_download(&self, id: MessageId) -> Result<DownloadStart> {
        let conversation = {
            let store = lock(self.inner.engine.store());
            let conversation = store.locate_id(id).ok_or(ClientError::UnknownMessage(id))?;
            let attachment = store
                .conversation(conversation)?
                .messages
                .iter()
                .find(|m| m.id == Some(id))
                .and_then(|m| m.payload.as_ref())
                .and_then(Content::attachment);
            match attachment {
                None => return Err(ClientError::NoAttachment(id)),
                Some(a) if matches!(a.data, FileData::Downloaded(_)) => return Ok(DownloadStart::Cached),
                Some(_) => conversation,
            }
        };

        if let Some(blob) = self.inner.cache.get(id)? {
            debug!(id = %id, "Serving file from local cache");
            self.materialize(conversation, id, blob.data);
            return Ok(DownloadStart::Cached);
        }

        let key = TransferKey::Download(id);
        {
            let mut transfers = self.transfers();
            if transfers.contains_key(&key) {
                return Ok(DownloadStart::AlreadyRunning);
            }
            transfers.insert(
                key,
                Transfer {
                    key,
                    conversation,
                    source: None,
                    secret: None,
                    token: CancelToken::new(),
                    state: TransferState::AwaitingAck,
                },
            );
        }

        if let Err(e) = self
            .inner
            .engine
            .transport()
            .post(&ClientRequest::DownloadFile { id })
            .await
        {
            self.fail(key, e.to_string());
            return Err(e.into());
        }
        Ok(DownloadStart::Requested)
    }

    /// Handle a `download_file` event: decrypt, cache, attach.
    pub async fn on_download(&self, event: DownloadEvent) {
        let id = event.id;
        let key = TransferKey::Download(id);
        if let Some(transfer) = self.transfers().get_mut(&key) {
            transfer.advance(TransferState::Transmitting);
        }

        let binary = match (event.status, event.binary) {
            (DownloadStatus::Success, Some(binary)) => binary,
            (status, _) => {
                self.download_failed(id, format!("server reported {status:?}"));
                return;
            }
        };

        let located = {
            let store = lock(self.inner.engine.store());
            store.locate_id(id).and_then(|conversation| {
                let conv = store.conversation(conversation).ok()?;
                let attachment = conv
                    .messages
                    .iter()
                    .find(|m| m.id == Some(id))?
                    .payload
                    .as_ref()?
                    .attachment()?;
                Some((
                    conversation,
                    conv.keyword.clone(),
                    attachment.encrypted_key.clone(),
                    attachment.encrypted_iv.clone(),
                    attachment.name.clone(),
                    attachment.mime.clone(),
                ))
            })
        };
        let Some((conversation, keyword, encrypted_key, encrypted_iv, name, mime)) = located else {
            self.download_failed(id, "no message with an attachment".to_string());
            return;
        };

        let crypto = Arc::clone(self.inner.engine.crypto());
        let decrypted = tokio::task::spawn_blocking(move || {
            crypto.decrypt_file(&binary, &encrypted_key, &encrypted_iv, &keyword)
        })
        .await;
        let data = match decrypted {
            Ok(Ok(plain)) => Bytes::from(plain),
            Ok(Err(e)) => {
                self.download_failed(id, e.to_string());
                return;
            }
            Err(e) => {
                self.download_failed(id, e.to_string());
                return;
            }
        };

        let blob = CachedBlob {
            data: data.clone(),
            file_name: event.file_name.or(Some(name)),
            file_type: event.file_type.or(Some(mime)),
        };
        if let Err(e) = self.inner.cache.put(id, &blob) {
            warn!(id = %id, error = %e, "Could not cache downloaded file");
        }

        self.materialize(conversation, id, data);
        if let Some(mut transfer) = self.transfers().remove(&key) {
            transfer.advance(TransferState::Complete);
        }
        info!(id = %id, "Download complete");
        self.emit(TransferEvent::Progress {
            key,
            percent: PROGRESS_DONE,
        });
        self.emit(TransferEvent::Completed { key });
    }

    fn download_failed(&self, id: MessageId, reason: String) {
        let key = TransferKey::Download(id);
        if self.transfers().contains_key(&key) {
            self.fail(key, reason);
        } else {
            warn!(id = %id, reason = %reason, "Download failed");
            self.emit(TransferEvent::DownloadFailed { id, reason });
        }
    }

    fn materialize(&self, conversation: ConversationId, id: MessageId, data: Bytes) {
        let mut store = lock(self.inner.engine.store());
        if let Some(attachment) = store
            .find_by_id_mut(conversation, id)
            .and_then(|m| m.payload.as_mut())
            .and_then(Content::attachment_mut)
        {
            attachment.data = FileData::Downloaded(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use TransferState::*;
        assert!(Queued.can_transition_to(AwaitingAck));
        assert!(AwaitingAck.can_transition_to(Transmitting));
        assert!(Transmitting.can_transition_to(Complete));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Transmitting.can_transition_to(Error));

        assert!(!Queued.can_transition_to(Transmitting));
        assert!(!Complete.can_transition_to(Error));
        assert!(!Cancelled.can_transition_to(Complete));
        assert!(!Transmitting.can_transition_to(AwaitingAck));
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime(Path::new("a/b/photo.JPG")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("report.pdf")), "application/pdf");
        assert_eq!(guess_mime(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_local_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        tokio::fs::write(&path, b"12345").await.unwrap();

        let file = LocalFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "cat.png");
        assert_eq!(file.size, 5);
        assert!(file.is_image());
    }
}
