// Transport layer: one persistent duplex channel with request correlation and
// a per-client event bus for unsolicited events.

pub mod bus;
pub mod client;
pub mod error;
pub mod link;
pub mod websocket;

pub use bus::{EventBus, InboundEvent, SubscriptionId, EVENT_DISCONNECTED};
pub use client::{TransportClient, TransportConfig};
pub use error::TransportError;
pub use link::{DuplexLink, Frame};
pub use websocket::connect_websocket;
