//! Wire protocol spoken over the duplex channel.
//!
//! Text frames carry JSON: outbound [`ClientRequest`]s tagged by `action` and
//! inbound [`ServerEvent`]s tagged by `event`. File bytes travel in a single
//! binary frame ([`UploadFrame`], bincode encoded).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{ConversationId, MessageId, TempId, UserId};

pub const EVENT_MESSAGES: &str = "messages";
pub const EVENT_SEND_ACK: &str = "send_message";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_DOWNLOAD_FILE: &str = "download_file";

/// Requests sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Fetch a page of history. Without `start_index` the server returns the
    /// newest page.
    LoadMessages {
        request_id: Uuid,
        conversation: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_index: Option<u32>,
    },

    /// Send a message. `text` is the encrypted content envelope.
    SendMessage {
        temp_id: TempId,
        conversation: ConversationId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<Vec<FileDescriptor>>,
    },

    /// Ask the server to abandon an upload.
    StopUpload { temp_id: TempId },

    /// Ask the server to stream a stored file back.
    DownloadFile { id: MessageId },
}

impl ClientRequest {
    pub fn action(&self) -> &'static str {
        match self {
            ClientRequest::LoadMessages { .. } => "load_messages",
            ClientRequest::SendMessage { .. } => "send_message",
            ClientRequest::StopUpload { .. } => "stop_upload",
            ClientRequest::DownloadFile { .. } => "download_file",
        }
    }

    /// Key under which the response to this request is expected.
    pub fn correlation(&self) -> Option<Correlation> {
        match self {
            ClientRequest::LoadMessages { request_id, .. } => Some(Correlation::Request(*request_id)),
            ClientRequest::SendMessage { temp_id, .. } => Some(Correlation::Temp(*temp_id)),
            ClientRequest::DownloadFile { id } => Some(Correlation::Download(*id)),
            ClientRequest::StopUpload { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// How a response is matched to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correlation {
    /// Explicit request id echoed by the server.
    Request(Uuid),
    /// Server-echoed temp id of an outbound message.
    Temp(TempId),
    /// Message id of a requested download.
    Download(MessageId),
}

/// File metadata announced in `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
}

/// Events pushed by the server, either as responses or unsolicited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Messages(MessagesPage),
    SendMessage(SendAck),
    NewMessage(NewMessageEvent),
    DownloadFile(DownloadEvent),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Messages(_) => EVENT_MESSAGES,
            ServerEvent::SendMessage(_) => EVENT_SEND_ACK,
            ServerEvent::NewMessage(_) => EVENT_NEW_MESSAGE,
            ServerEvent::DownloadFile(_) => EVENT_DOWNLOAD_FILE,
        }
    }

    pub fn correlation(&self) -> Option<Correlation> {
        match self {
            ServerEvent::Messages(page) => page.request_id.map(Correlation::Request),
            ServerEvent::SendMessage(ack) => Some(Correlation::Temp(ack.temp_id)),
            ServerEvent::DownloadFile(download) => Some(Correlation::Download(download.id)),
            ServerEvent::NewMessage(_) => None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesPage {
    #[serde(default)]
    pub request_id: Option<Uuid>,
    pub conversation: ConversationId,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

/// A message record as stored by the server; `payload` is still encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    pub author: UserId,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Metadata accepted, the server waits for the binary frame.
    AwaitingAck,
    /// Durably stored; `id` is attached.
    Sended,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    pub status: AckStatus,
    pub temp_id: TempId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessageEvent {
    pub conversation: ConversationId,
    pub author: UserId,
    pub payload: String,
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
}

impl From<NewMessageEvent> for RawMessage {
    fn from(event: NewMessageEvent) -> Self {
        Self {
            id: event.id,
            author: event.author,
            payload: event.payload,
            timestamp: event.timestamp,
            temp_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadEvent {
    pub id: MessageId,
    pub status: DownloadStatus,
    /// Encrypted file bytes, base64 in JSON.
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub binary: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Binary frame carrying one encrypted file, sent after `awaiting_ack`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFrame {
    pub temp_id: TempId,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub binary: Vec<u8>,
}

impl UploadFrame {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(data)?)
    }
}

// ---------------------------------------------------------------------------
// Content envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Text,
    Image,
    File,
}

/// File parameters recorded inside an encrypted envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub mime: String,
    pub size: u64,
    pub encrypted_key: String,
    pub encrypted_iv: String,
}

/// Structured plaintext of a message. Plaintext that does not parse as an
/// envelope is treated as bare text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEnvelope {
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
    /// Base64 thumbnail for images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl ContentEnvelope {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            file: None,
            preview: None,
        }
    }

    pub fn parse(plaintext: &str) -> Option<Self> {
        let trimmed = plaintext.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
