//! # murmur-shared
//!
//! Types shared by every Murmur crate: identifiers, the wire protocol spoken
//! over the duplex channel, the crypto adapter, and error types.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, ProtocolError};
