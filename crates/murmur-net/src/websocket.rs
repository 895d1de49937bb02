use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use murmur_shared::constants::FRAME_CHANNEL_CAPACITY;

use crate::link::{DuplexLink, Frame};

/// Open a WebSocket and bridge it to a [`DuplexLink`].
///
/// Two tasks are spawned: a writer draining the outbound channel into the
/// socket and a reader forwarding socket messages inbound. When the socket
/// closes the reader drops its sender, which the transport client observes as
/// a disconnect.
pub async fn connect_websocket(url: &str) -> anyhow::Result<DuplexLink> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .map_err(|e| anyhow::anyhow!("WebSocket connect to {url} failed: {e}"))?;
    info!(url = %url, "WebSocket connected");

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data.to_vec()),
                Frame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(message).await {
                warn!(error = %e, "WebSocket write failed");
                break;
            }
        }
        debug!("WebSocket writer finished");
    });

    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let frame = match message {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(data)) => Frame::Binary(Bytes::from(data)),
                Ok(Message::Close(_)) => break,
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "WebSocket read failed");
                    break;
                }
            };
            if in_tx.send(frame).await.is_err() {
                break;
            }
        }
        info!("WebSocket reader finished");
    });

    Ok(DuplexLink {
        outbound: out_tx,
        inbound: in_rx,
    })
}
