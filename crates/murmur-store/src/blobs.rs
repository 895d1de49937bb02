use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

/// A decrypted file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub mid: i64,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub data: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

impl Database {
    // replaces any earlier copy of the same message's file
    pub fn put_file(&self, file: &CachedFile) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO file_cache (mid, file_name, file_type, data, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file.mid,
                file.file_name,
                file.file_type,
                file.data,
                file.cached_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_file(&self, mid: i64) -> Result<Option<CachedFile>> {
        let row = self
            .conn()
            .query_row(
                "SELECT mid, file_name, file_type, data, cached_at
                 FROM file_cache WHERE mid = ?1",
                params![mid],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((mid, file_name, file_type, data, cached_str)) = row else {
            return Ok(None);
        };

        let cached_at = DateTime::parse_from_rfc3339(&cached_str)?.with_timezone(&Utc);
        Ok(Some(CachedFile {
            mid,
            file_name,
            file_type,
            data,
            cached_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mid: i64, data: &[u8]) -> CachedFile {
        CachedFile {
            mid,
            file_name: Some("photo.jpg".into()),
            file_type: Some("image/jpeg".into()),
            data: data.to_vec(),
            cached_at: Utc::now(),
        }
    }

    fn row_count(db: &Database) -> i64 {
        db.conn()
            .query_row("SELECT COUNT(*) FROM file_cache", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn put_then_get() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_file(1).unwrap(), None);

        db.put_file(&sample(1, b"abc")).unwrap();
        let got = db.get_file(1).unwrap().unwrap();
        assert_eq!(got.data, b"abc");
        assert_eq!(got.file_type.as_deref(), Some("image/jpeg"));
        assert_eq!(db.get_file(2).unwrap(), None);
    }

    #[test]
    fn put_replaces_existing() {
        let db = Database::open_in_memory().unwrap();
        db.put_file(&sample(7, b"old")).unwrap();
        db.put_file(&sample(7, b"new")).unwrap();

        assert_eq!(row_count(&db), 1);
        assert_eq!(db.get_file(7).unwrap().unwrap().data, b"new");
    }
}
