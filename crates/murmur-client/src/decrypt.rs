//! Batch decryption of message records.
//!
//! Each record is decrypted on the blocking pool independently of the others.
//! A record that fails keeps its place in the batch with `payload = None`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::future::join_all;
use tracing::warn;

use murmur_shared::crypto::{CryptoAdapter, Keyword};
use murmur_shared::protocol::{ContentEnvelope, ContentKind, FileMeta, RawMessage};
use murmur_shared::CryptoError;

use crate::model::{Attachment, Content, FileData, Message};

/// Structure decrypted plaintext. Anything that is not a content envelope is
/// bare text.
pub fn normalize(plaintext: &str) -> Content {
    let Some(envelope) = ContentEnvelope::parse(plaintext) else {
        return Content::Text {
            text: plaintext.to_string(),
        };
    };

    let text = envelope.text.unwrap_or_default();
    let file = envelope.file.map(remote_attachment);
    match envelope.kind {
        ContentKind::Text => Content::Text { text },
        ContentKind::Image => Content::Image {
            text,
            preview: envelope.preview.as_deref().and_then(decode_preview),
            file,
        },
        ContentKind::File => Content::File { text, file },
    }
}

fn remote_attachment(meta: FileMeta) -> Attachment {
    Attachment {
        name: meta.name,
        mime: meta.mime,
        size: meta.size,
        encrypted_key: meta.encrypted_key,
        encrypted_iv: meta.encrypted_iv,
        data: FileData::Remote,
    }
}

fn decode_preview(encoded: &str) -> Option<FileData> {
    match STANDARD.decode(encoded) {
        Ok(bytes) => Some(FileData::Inline(Bytes::from(bytes))),
        Err(e) => {
            warn!(error = %e, "Discarding undecodable image preview");
            None
        }
    }
}

fn open_payload(crypto: &dyn CryptoAdapter, keyword: &Keyword, payload: &str) -> Result<Content, CryptoError> {
    let plain = crypto.decrypt_text(payload, keyword)?;
    let text = String::from_utf8(plain).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    Ok(normalize(&text))
}

/// Decrypt one record into a confirmed message.
pub fn decrypt_record(crypto: &dyn CryptoAdapter, keyword: &Keyword, raw: RawMessage) -> Message {
    let payload = match open_payload(crypto, keyword, &raw.payload) {
        Ok(content) => Some(content),
        Err(e) => {
            warn!(id = %raw.id, error = %e, "Message payload unavailable");
            None
        }
    };
    let mut message = Message::confirmed(raw.id, raw.author, payload, raw.timestamp);
    message.temp_id = raw.temp_id;
    message
}

/// Decrypt `records` in parallel, preserving their order.
pub async fn decrypt_batch(
    crypto: Arc<dyn CryptoAdapter>,
    keyword: Keyword,
    records: Vec<RawMessage>,
) -> Vec<Message> {
    let tasks = records.into_iter().map(|raw| {
        let crypto = Arc::clone(&crypto);
        let keyword = keyword.clone();
        let fallback = Message::confirmed(raw.id, raw.author, None, raw.timestamp);
        async move {
            match tokio::task::spawn_blocking(move || decrypt_record(crypto.as_ref(), &keyword, raw)).await {
                Ok(message) => message,
                Err(e) => {
                    warn!(id = ?fallback.id, error = %e, "Decrypt task failed");
                    fallback
                }
            }
        }
    });
    join_all(tasks).await
}
