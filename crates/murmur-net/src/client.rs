//! Request/response correlation over a [`DuplexLink`].
//!
//! A background reader task drains inbound frames. Each parsed event is first
//! offered to the pending-request table (matched by its [`Correlation`] key);
//! anything unmatched is published on the [`EventBus`]. When the link closes,
//! every pending request is rejected and a synthetic `disconnected` event is
//! published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use murmur_shared::constants::DEFAULT_REQUEST_TIMEOUT_SECS;
use murmur_shared::protocol::{ClientRequest, Correlation, ServerEvent};

use crate::bus::{EventBus, InboundEvent, SubscriptionId};
use crate::error::TransportError;
use crate::link::{DuplexLink, Frame};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long `send` waits for the correlated response.
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

struct Inner {
    outbound: mpsc::Sender<Frame>,
    /// Guarded together with `connected` so no request can be registered
    /// after the reader has drained the table.
    pending: Mutex<PendingTable>,
    connected: AtomicBool,
    bus: EventBus,
    config: TransportConfig,
}

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiters: HashMap<Correlation, oneshot::Sender<ServerEvent>>,
}

/// Cheaply cloneable handle to one duplex connection.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    /// Take ownership of `link` and spawn the inbound reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(link: DuplexLink, config: TransportConfig) -> Self {
        let DuplexLink { outbound, inbound } = link;
        let inner = Arc::new(Inner {
            outbound,
            pending: Mutex::new(PendingTable::default()),
            connected: AtomicBool::new(true),
            bus: EventBus::new(),
            config,
        });

        tokio::spawn(read_loop(Arc::clone(&inner), inbound));

        Self { inner }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe<F>(&self, event_name: &'static str, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(event_name, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a correlated response.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().waiters.len()
    }

    /// Send `request` and wait for the first inbound event carrying the same
    /// correlation key.
    pub async fn send(&self, request: ClientRequest) -> Result<ServerEvent, TransportError> {
        let correlation = request
            .correlation()
            .ok_or(TransportError::Uncorrelated(request.action()))?;
        let text = request.to_json()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.inner.lock_pending();
            if table.closed {
                return Err(TransportError::Disconnected);
            }
            if table.waiters.contains_key(&correlation) {
                return Err(TransportError::DuplicateRequest);
            }
            table.waiters.insert(correlation, tx);
        }

        debug!(action = request.action(), ?correlation, "Sending correlated request");

        if self.inner.outbound.send(Frame::Text(text)).await.is_err() {
            self.inner.lock_pending().waiters.remove(&correlation);
            return Err(TransportError::Disconnected);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            // Sender dropped: the reader drained the table on disconnect.
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.inner.lock_pending().waiters.remove(&correlation);
                warn!(action = request.action(), ?correlation, "Request timed out");
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget text frame.
    pub async fn post(&self, request: &ClientRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let text = request.to_json()?;
        debug!(action = request.action(), "Posting request");
        self.inner
            .outbound
            .send(Frame::Text(text))
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let data = data.into();
        debug!(len = data.len(), "Sending binary frame");
        self.inner
            .outbound
            .send(Frame::Binary(data))
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    /// Ask the remote side to close. The reader observes the close and runs
    /// the usual disconnect path.
    pub async fn close(&self) {
        let _ = self.inner.outbound.send(Frame::Close).await;
    }
}

impl Inner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, event: ServerEvent) {
        if let Some(correlation) = event.correlation() {
            let waiter = self.lock_pending().waiters.remove(&correlation);
            if let Some(tx) = waiter {
                debug!(event = event.name(), ?correlation, "Resolved pending request");
                // Receiver may have timed out in the meantime; nothing to do then.
                let _ = tx.send(event);
                return;
            }
        }
        self.bus.publish(&InboundEvent::Server(event));
    }

    fn shut_down(&self) {
        let dropped = {
            let mut table = self.lock_pending();
            table.closed = true;
            self.connected.store(false, Ordering::Release);
            let n = table.waiters.len();
            table.waiters.clear();
            n
        };
        info!(rejected = dropped, "Transport disconnected");
        self.bus.publish(&InboundEvent::Disconnected);
    }
}

async fn read_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<Frame>) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Text(text) => match ServerEvent::from_json(&text) {
                Ok(event) => inner.dispatch(event),
                Err(e) => warn!(error = %e, len = text.len(), "Dropping unparseable inbound frame"),
            },
            Frame::Binary(data) => {
                debug!(len = data.len(), "Ignoring unsolicited binary frame");
            }
            Frame::Close => {
                debug!("Remote closed the channel");
                break;
            }
        }
    }

    inner.shut_down();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use murmur_shared::protocol::{AckStatus, MessagesPage, NewMessageEvent, SendAck};
    use murmur_shared::types::{ConversationId, MessageId, TempId, UserId};
    use uuid::Uuid;

    use super::*;
    use crate::bus::EVENT_DISCONNECTED;

    fn load_request(request_id: Uuid) -> ClientRequest {
        ClientRequest::LoadMessages {
            request_id,
            conversation: ConversationId(1),
            start_index: None,
        }
    }

    async fn push(peer: &DuplexLink, event: ServerEvent) {
        peer.outbound
            .send(Frame::Text(event.to_json().unwrap()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_resolves_with_matching_response() {
        let (client_end, mut peer) = DuplexLink::pair();
        let client = TransportClient::start(client_end, TransportConfig::default());

        let server = tokio::spawn(async move {
            let Some(Frame::Text(text)) = peer.inbound.recv().await else {
                panic!("expected text frame");
            };
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            let request_id: Uuid = serde_json::from_value(value["request_id"].clone()).unwrap();

            // An unrelated page first: must not resolve our request.
            push(
                &peer,
                ServerEvent::Messages(MessagesPage {
                    request_id: Some(Uuid::new_v4()),
                    conversation: ConversationId(9),
                    messages: vec![],
                }),
            )
            .await;
            push(
                &peer,
                ServerEvent::Messages(MessagesPage {
                    request_id: Some(request_id),
                    conversation: ConversationId(1),
                    messages: vec![],
                }),
            )
            .await;
            peer
        });

        let response = client.send(load_request(Uuid::new_v4())).await.unwrap();
        match response {
            ServerEvent::Messages(page) => assert_eq!(page.conversation, ConversationId(1)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.pending_count(), 0);
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_events_reach_every_subscriber() {
        let (client_end, peer) = DuplexLink::pair();
        let client = TransportClient::start(client_end, TransportConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        for n in 0..2 {
            let tx = tx.clone();
            client.subscribe("new_message", move |event| {
                let _ = tx.send((n, event.clone()));
            });
        }

        push(
            &peer,
            ServerEvent::NewMessage(NewMessageEvent {
                conversation: ConversationId(1),
                author: UserId(2),
                payload: "x".into(),
                id: MessageId(3),
                timestamp: Utc::now(),
            }),
        )
        .await;

        let (first, _) = rx.recv().await.unwrap();
        let (second, event) = rx.recv().await.unwrap();
        assert_eq!((first, second), (0, 1));
        assert_eq!(event.name(), "new_message");
    }

    #[tokio::test]
    async fn test_unsubscribe_detaches_handler() {
        let (client_end, _peer) = DuplexLink::pair();
        let client = TransportClient::start(client_end, TransportConfig::default());

        let id = client.subscribe("send_message", |_| {});
        assert_eq!(client.bus().handler_count("send_message"), 1);
        assert!(client.unsubscribe(id));
        assert!(!client.unsubscribe(id));
        assert_eq!(client.bus().handler_count("send_message"), 0);
    }

    #[tokio::test]
    async fn test_uncorrelated_ack_is_published() {
        let (client_end, peer) = DuplexLink::pair();
        let client = TransportClient::start(client_end, TransportConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.subscribe("send_message", move |event| {
            let _ = tx.send(event.clone());
        });

        let ack = SendAck {
            status: AckStatus::Sended,
            temp_id: TempId(123456789),
            id: Some(MessageId(42)),
        };
        push(&peer, ServerEvent::SendMessage(ack)).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            InboundEvent::Server(ServerEvent::SendMessage(ack))
        );
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_notifies() {
        let (client_end, mut peer) = DuplexLink::pair();
        let client = TransportClient::start(client_end, TransportConfig::default());

        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = disconnects.clone();
        client.subscribe(EVENT_DISCONNECTED, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.send(load_request(Uuid::new_v4())).await })
        };

        // Wait for the request to hit the wire, then hang up.
        assert!(matches!(peer.inbound.recv().await, Some(Frame::Text(_))));
        drop(peer);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert!(!client.is_connected());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        assert!(matches!(
            client.send(load_request(Uuid::new_v4())).await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            client.post(&ClientRequest::StopUpload { temp_id: TempId(100000000) }).await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending_entry() {
        let (client_end, _peer) = DuplexLink::pair();
        let client = TransportClient::start(
            client_end,
            TransportConfig {
                request_timeout: Duration::from_millis(20),
            },
        );

        let result = client.send(load_request(Uuid::new_v4())).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_upload_cannot_await() {
        let (client_end, _peer) = DuplexLink::pair();
        let client = TransportClient::start(client_end, TransportConfig::default());
        let result = client
            .send(ClientRequest::StopUpload { temp_id: TempId(100000000) })
            .await;
        assert!(matches!(result, Err(TransportError::Uncorrelated("stop_upload"))));
    }
}
