//! # murmur-probe
//!
//! Connects to a Murmur server, opens one conversation and prints its
//! history, oldest first. Useful for checking a deployment and a keyword end
//! to end.
//!
//! Besides the usual `MURMUR_*` client settings it reads:
//! - `MURMUR_CONVERSATION_ID`: conversation to open (required)
//! - `MURMUR_KEYWORD`: conversation key, 64 hex chars or a passphrase (required)
//! - `MURMUR_PROBE_PAGES`: older pages to fetch after the first (default 0)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use murmur_client::{init_tracing, ClientConfig, LoadOutcome, Messenger};
use murmur_net::connect_websocket;
use murmur_shared::constants::APP_NAME;
use murmur_shared::crypto::{Keyword, XChaChaAdapter};
use murmur_shared::types::{ConversationId, ConversationKind};
use murmur_store::{BlobCache, SqliteBlobCache};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting {} probe v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let conversation = ConversationId(
        std::env::var("MURMUR_CONVERSATION_ID")
            .context("MURMUR_CONVERSATION_ID is not set")?
            .parse()
            .context("MURMUR_CONVERSATION_ID must be an integer")?,
    );
    let keyword = parse_keyword(&std::env::var("MURMUR_KEYWORD").context("MURMUR_KEYWORD is not set")?);
    let extra_pages: u32 = match std::env::var("MURMUR_PROBE_PAGES") {
        Ok(raw) => raw.parse().context("MURMUR_PROBE_PAGES must be an integer")?,
        Err(_) => 0,
    };

    let cache: Arc<dyn BlobCache> = match &config.cache_path {
        Some(path) => Arc::new(SqliteBlobCache::open_at(path)?),
        None => Arc::new(SqliteBlobCache::open_default()?),
    };

    let link = connect_websocket(&config.server_url).await?;
    let messenger = Messenger::start(link, &config, Arc::new(XChaChaAdapter), cache);
    messenger.add_conversation(conversation, ConversationKind::Direct, keyword);

    let loaded = messenger.open_conversation(conversation).await?;
    info!(conversation = %conversation, loaded, "Opened conversation");

    page_history(&messenger, conversation, extra_pages, config.history_debounce).await?;

    let snapshot = messenger.snapshot(conversation)?;
    for message in &snapshot.messages {
        let id = message.id.map_or_else(|| "-".to_string(), |id| id.to_string());
        let body = message
            .payload
            .as_ref()
            .map_or_else(|| "[unavailable]".to_string(), |c| c.summary());
        println!("{} #{id} <{}> {body}", message.created_at.to_rfc3339(), message.author_id);
    }
    info!(count = snapshot.messages.len(), exhausted = snapshot.history_exhausted, "Done");

    messenger.close().await;
    Ok(())
}

fn parse_keyword(raw: &str) -> Keyword {
    Keyword::from_hex(raw).unwrap_or_else(|_| Keyword::from_passphrase(raw))
}

/// Fetch up to `pages` older pages. "Load more" is debounced from the moment
/// the conversation was opened, so wait that out first.
async fn page_history(
    messenger: &Messenger,
    conversation: ConversationId,
    pages: u32,
    debounce: Duration,
) -> murmur_client::Result<u32> {
    if pages == 0 {
        return Ok(0);
    }
    tokio::time::sleep(debounce).await;

    let mut fetched = 0;
    while fetched < pages {
        match messenger.load_more(conversation).await? {
            LoadOutcome::Loaded(n) => {
                info!(added = n, "Loaded older page");
                fetched += 1;
            }
            LoadOutcome::TooSoon => tokio::time::sleep(debounce).await,
            outcome => {
                info!(?outcome, "Stopped paging");
                break;
            }
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use murmur_net::{DuplexLink, Frame};
    use murmur_shared::crypto::CryptoAdapter;
    use murmur_shared::protocol::{ClientRequest, MessagesPage, RawMessage, ServerEvent};
    use murmur_shared::types::{MessageId, UserId};
    use murmur_store::MemoryBlobCache;

    use super::*;

    const CONV: ConversationId = ConversationId(3);

    /// Answer `pages.len()` `load_messages` requests in order and report the
    /// start index of each.
    async fn serve(mut server: DuplexLink, keyword: Keyword, pages: Vec<Vec<i64>>) -> (DuplexLink, Vec<Option<u32>>) {
        let mut starts = Vec::new();
        for ids in pages {
            let Some(Frame::Text(text)) = server.inbound.recv().await else {
                panic!("expected a request");
            };
            let ClientRequest::LoadMessages { request_id, conversation, start_index } =
                serde_json::from_str(&text).unwrap()
            else {
                panic!("expected load_messages");
            };
            starts.push(start_index);
            let messages = ids
                .into_iter()
                .map(|id| RawMessage {
                    id: MessageId(id),
                    author: UserId(2),
                    payload: XChaChaAdapter.encrypt(format!("m{id}").as_bytes(), &keyword).unwrap(),
                    timestamp: Utc::now(),
                    temp_id: None,
                })
                .collect();
            let event = ServerEvent::Messages(MessagesPage {
                request_id: Some(request_id),
                conversation,
                messages,
            });
            server.outbound.send(Frame::Text(event.to_json().unwrap())).await.unwrap();
        }
        (server, starts)
    }

    #[tokio::test]
    async fn test_paging_right_after_open_waits_for_debounce() {
        let config = ClientConfig {
            page_size: 2,
            history_debounce: Duration::from_millis(150),
            ..ClientConfig::default()
        };
        let (client_end, server_end) = DuplexLink::pair();
        let messenger = Messenger::start(
            client_end,
            &config,
            Arc::new(XChaChaAdapter),
            Arc::new(MemoryBlobCache::new()),
        );
        let keyword = Keyword::from_passphrase("paging");
        messenger.add_conversation(CONV, ConversationKind::Direct, keyword.clone());
        let server = tokio::spawn(serve(server_end, keyword, vec![vec![5, 6], vec![3, 4], vec![1, 2]]));

        assert_eq!(messenger.open_conversation(CONV).await.unwrap(), 2);
        let fetched = page_history(&messenger, CONV, 2, config.history_debounce).await.unwrap();
        assert_eq!(fetched, 2);

        let (_server_end, starts) = server.await.unwrap();
        assert_eq!(starts, vec![None, Some(2), Some(4)]);
        let ids: Vec<_> = messenger
            .snapshot(CONV)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.id.unwrap().0)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_zero_pages_sends_nothing() {
        let (client_end, mut server_end) = DuplexLink::pair();
        let messenger = Messenger::start(
            client_end,
            &ClientConfig::default(),
            Arc::new(XChaChaAdapter),
            Arc::new(MemoryBlobCache::new()),
        );
        let fetched = page_history(&messenger, CONV, 0, Duration::from_secs(5)).await.unwrap();
        assert_eq!(fetched, 0);
        assert!(server_end.inbound.try_recv().is_err());
    }
}
