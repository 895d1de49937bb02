//! Realtime messenger client engine.
//!
//! Keeps an encrypted conversation log in sync with a remote peer over one
//! duplex channel: optimistic sends reconciled by server acks, batch
//! decryption, encrypted file uploads and downloads, and backward history
//! pagination. [`Messenger`] is the entry point.

pub mod config;
pub mod decrypt;
pub mod error;
pub mod history;
pub mod messenger;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod temp_id;
pub mod transfer;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use history::LoadOutcome;
pub use messenger::Messenger;
pub use model::{Content, ConversationSnapshot, FileData, Message, MessageStatus};
pub use transfer::{DownloadStart, LocalFile, TransferEvent, TransferKey};

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_client=debug,murmur_net=debug,murmur_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}
