//! Client-side domain model: decrypted messages and conversations.
//!
//! Everything here is plain data. Mutation happens through
//! [`MessageStore`](crate::store::MessageStore); the UI reads
//! [`ConversationSnapshot`]s.

use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use murmur_shared::crypto::Keyword;
use murmur_shared::types::{ConversationId, ConversationKind, MessageId, TempId, UserId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Created locally, not yet acknowledged.
    Pending,
    /// Durably accepted by the server; `id` is set.
    Confirmed,
    /// Send or upload failed, or the upload was cancelled.
    Failed,
}

/// Where the bytes of an attachment currently live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum FileData {
    /// Preview bytes supplied by the UI for a not-yet-uploaded file.
    Inline(Bytes),
    /// Not-yet-uploaded file without a preview.
    Local(PathBuf),
    /// Stored on the server, not downloaded.
    Remote,
    /// Decrypted download.
    Downloaded(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub size: u64,
    /// Per-file key and IV sealed with the conversation keyword.
    #[serde(skip)]
    pub encrypted_key: String,
    #[serde(skip)]
    pub encrypted_iv: String,
    pub data: FileData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        text: String,
        preview: Option<FileData>,
        file: Option<Attachment>,
    },
    File {
        text: String,
        file: Option<Attachment>,
    },
}

impl Content {
    pub fn text(&self) -> &str {
        match self {
            Content::Text { text } | Content::Image { text, .. } | Content::File { text, .. } => text,
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Content::Text { .. } => None,
            Content::Image { file, .. } | Content::File { file, .. } => file.as_ref(),
        }
    }

    pub fn attachment_mut(&mut self) -> Option<&mut Attachment> {
        match self {
            Content::Text { .. } => None,
            Content::Image { file, .. } | Content::File { file, .. } => file.as_mut(),
        }
    }

    /// One-line summary for conversation lists.
    pub fn summary(&self) -> String {
        match self {
            Content::Text { text } => text.clone(),
            Content::Image { text, .. } if text.is_empty() => "[image]".to_string(),
            Content::Image { text, .. } => format!("[image] {text}"),
            Content::File { text, file } => {
                let name = file.as_ref().map_or("file", |f| f.name.as_str());
                if text.is_empty() {
                    format!("[{name}]")
                } else {
                    format!("[{name}] {text}")
                }
            }
        }
    }
}

/// Dedup key: the server id once known, otherwise the temp id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Id(MessageId),
    Temp(TempId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub temp_id: Option<TempId>,
    pub id: Option<MessageId>,
    pub author_id: UserId,
    pub status: MessageStatus,
    /// `None` when the payload could not be decrypted.
    pub payload: Option<Content>,
    /// Present only while a file transfer for this message is active.
    pub upload_progress: Option<u8>,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Phase one of a send: the optimistic local record.
    pub fn pending(temp_id: TempId, author_id: UserId, content: Content) -> Self {
        Self {
            temp_id: Some(temp_id),
            id: None,
            author_id,
            status: MessageStatus::Pending,
            payload: Some(content),
            upload_progress: None,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    pub fn confirmed(
        id: MessageId,
        author_id: UserId,
        payload: Option<Content>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            temp_id: None,
            id: Some(id),
            author_id,
            status: MessageStatus::Confirmed,
            payload,
            upload_progress: None,
            cancelled: false,
            created_at,
        }
    }

    pub fn key(&self) -> Option<MessageKey> {
        self.id
            .map(MessageKey::Id)
            .or(self.temp_id.map(MessageKey::Temp))
    }

    pub fn matches(&self, key: MessageKey) -> bool {
        match key {
            MessageKey::Id(id) => self.id == Some(id),
            MessageKey::Temp(temp) => self.temp_id == Some(temp),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastMessage {
    pub author_id: UserId,
    pub summary: String,
    pub at: DateTime<Utc>,
}

impl LastMessage {
    pub fn of(message: &Message) -> Self {
        Self {
            author_id: message.author_id,
            summary: message
                .payload
                .as_ref()
                .map_or_else(|| "[unavailable]".to_string(), Content::summary),
            at: message.created_at,
        }
    }
}

#[derive(Debug)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub keyword: Keyword,
    pub messages: Vec<Message>,
    pub messages_loaded: bool,
    /// Number of history messages already requested.
    pub pagination_cursor: u32,
    /// An empty history page was received; no further "load more".
    pub history_exhausted: bool,
    pub last_message: Option<LastMessage>,
    pub unread: u32,
    /// When the initial page arrived.
    pub loaded_at: Option<Instant>,
    /// A page request (initial or older) is in flight.
    pub loading: bool,
}

impl Conversation {
    pub fn new(id: ConversationId, kind: ConversationKind, keyword: Keyword) -> Self {
        Self {
            id,
            kind,
            keyword,
            messages: Vec::new(),
            messages_loaded: false,
            pagination_cursor: 0,
            history_exhausted: false,
            last_message: None,
            unread: 0,
            loaded_at: None,
            loading: false,
        }
    }

    pub fn position(&self, key: MessageKey) -> Option<usize> {
        self.messages.iter().position(|m| m.matches(key))
    }

    pub fn contains(&self, key: MessageKey) -> bool {
        self.position(key).is_some()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.id,
            kind: self.kind,
            messages: self.messages.clone(),
            messages_loaded: self.messages_loaded,
            history_exhausted: self.history_exhausted,
            last_message: self.last_message.clone(),
            unread: self.unread,
        }
    }
}

/// Read-only copy handed to presentation code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSnapshot {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub messages: Vec<Message>,
    pub messages_loaded: bool,
    pub history_exhausted: bool,
    pub last_message: Option<LastMessage>,
    pub unread: u32,
}
