//! Frame-level duplex link.
//!
//! A [`DuplexLink`] is the pair of channels a [`TransportClient`] talks
//! through. The WebSocket connector produces one bound to a socket; tests use
//! [`DuplexLink::pair`] to script the remote side in memory.
//!
//! [`TransportClient`]: crate::TransportClient

use bytes::Bytes;
use tokio::sync::mpsc;

use murmur_shared::constants::FRAME_CHANNEL_CAPACITY;

/// One message on the duplex channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Structured JSON text.
    Text(String),
    /// Raw bytes (file uploads).
    Binary(Bytes),
    /// Orderly close requested by either side.
    Close,
}

/// Sender/receiver halves of one end of the channel.
#[derive(Debug)]
pub struct DuplexLink {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl DuplexLink {
    /// Two connected in-memory ends: whatever one side sends on `outbound`
    /// arrives on the other side's `inbound`.
    pub fn pair() -> (DuplexLink, DuplexLink) {
        let (a_tx, a_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        (
            DuplexLink {
                outbound: a_tx,
                inbound: b_rx,
            },
            DuplexLink {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}
