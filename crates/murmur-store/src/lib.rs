//! # murmur-store
//!
//! Local persistent store for decrypted file payloads.
//!
//! The engine only sees the [`BlobCache`] trait: `put` a decrypted file under
//! its server message id, `get` it back later. [`SqliteBlobCache`] keeps the
//! bytes in a SQLite database in the platform data directory;
//! [`MemoryBlobCache`] keeps them in a map for tests and throwaway sessions.

pub mod blobs;
pub mod cache;
pub mod database;
pub mod migrations;

mod error;

pub use cache::{BlobCache, CachedBlob, MemoryBlobCache, SqliteBlobCache};
pub use database::Database;
pub use error::StoreError;
