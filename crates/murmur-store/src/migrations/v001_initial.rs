//! v001 -- Initial schema creation.
//!
//! Creates the `file_cache` table holding decrypted downloads keyed by the
//! server-assigned message id.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS file_cache (
    mid        INTEGER PRIMARY KEY NOT NULL,  -- server message id
    file_name  TEXT,
    file_type  TEXT,
    data       BLOB NOT NULL,                 -- decrypted bytes
    cached_at  TEXT NOT NULL                  -- RFC-3339
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
