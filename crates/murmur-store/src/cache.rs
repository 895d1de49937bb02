use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use chrono::Utc;

use murmur_shared::types::MessageId;

use crate::blobs::CachedFile;
use crate::database::Database;
use crate::error::Result;

/// A decrypted file as handed to and from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlob {
    pub data: Bytes,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
}

/// Local persistent store for decrypted files, keyed by message id.
pub trait BlobCache: Send + Sync {
    fn put(&self, mid: MessageId, blob: &CachedBlob) -> Result<()>;
    fn get(&self, mid: MessageId) -> Result<Option<CachedBlob>>;
}

/// SQLite-backed cache. The connection is not `Sync`, so calls serialize on
/// an internal mutex.
pub struct SqliteBlobCache {
    db: Mutex<Database>,
}

impl SqliteBlobCache {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Database::new()?))
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }
}

impl BlobCache for SqliteBlobCache {
    fn put(&self, mid: MessageId, blob: &CachedBlob) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.put_file(&CachedFile {
            mid: mid.0,
            file_name: blob.file_name.clone(),
            file_type: blob.file_type.clone(),
            data: blob.data.to_vec(),
            cached_at: Utc::now(),
        })?;
        tracing::debug!(mid = %mid, len = blob.data.len(), "cached decrypted file");
        Ok(())
    }

    fn get(&self, mid: MessageId) -> Result<Option<CachedBlob>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(db.get_file(mid.0)?.map(|file| CachedBlob {
            data: Bytes::from(file.data),
            file_name: file.file_name,
            file_type: file.file_type,
        }))
    }
}

#[derive(Default)]
pub struct MemoryBlobCache {
    entries: Mutex<HashMap<MessageId, CachedBlob>>,
}

impl MemoryBlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobCache for MemoryBlobCache {
    fn put(&self, mid: MessageId, blob: &CachedBlob) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mid, blob.clone());
        Ok(())
    }

    fn get(&self, mid: MessageId) -> Result<Option<CachedBlob>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mid)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(data: &'static [u8]) -> CachedBlob {
        CachedBlob {
            data: Bytes::from_static(data),
            file_name: Some("notes.txt".into()),
            file_type: None,
        }
    }

    fn exercise(cache: &dyn BlobCache) {
        assert_eq!(cache.get(MessageId(1)).unwrap(), None);
        cache.put(MessageId(1), &blob(b"hello")).unwrap();
        assert_eq!(cache.get(MessageId(1)).unwrap(), Some(blob(b"hello")));
        assert_eq!(cache.get(MessageId(2)).unwrap(), None);
    }

    #[test]
    fn sqlite_cache_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteBlobCache::open_at(&dir.path().join("cache.db")).unwrap();
        exercise(&cache);
    }

    #[test]
    fn sqlite_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        SqliteBlobCache::open_at(&path)
            .unwrap()
            .put(MessageId(9), &blob(b"kept"))
            .unwrap();

        let reopened = SqliteBlobCache::open_at(&path).unwrap();
        assert_eq!(reopened.get(MessageId(9)).unwrap(), Some(blob(b"kept")));
    }

    #[test]
    fn memory_cache_put_get() {
        let cache = MemoryBlobCache::new();
        exercise(&cache);
        assert_eq!(cache.len(), 1);
    }
}
