use murmur_net::TransportError;
use murmur_shared::types::{ConversationId, MessageId, TempId};
use murmur_shared::{CryptoError, ProtocolError};
use murmur_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown conversation {0}")]
    UnknownConversation(ConversationId),

    #[error("Unknown message {0}")]
    UnknownMessage(MessageId),

    #[error("Message {0} has no attached file")]
    NoAttachment(MessageId),

    #[error("File {name} too large: {size} bytes (max {max})")]
    FileTooLarge { name: String, size: u64, max: u64 },

    #[error("Message {0} cannot be retried")]
    NotRetryable(TempId),

    #[error("Unexpected response event: {0}")]
    UnexpectedResponse(&'static str),
}

pub type Result<T> = std::result::Result<T, ClientError>;
