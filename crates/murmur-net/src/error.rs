use std::time::Duration;

use murmur_shared::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    /// The duplex channel is gone; nothing sent on it will be answered.
    #[error("Transport disconnected")]
    Disconnected,

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Action {0} has no correlation key and cannot await a response")]
    Uncorrelated(&'static str),

    #[error("A request with the same correlation key is already in flight")]
    DuplicateRequest,
}
