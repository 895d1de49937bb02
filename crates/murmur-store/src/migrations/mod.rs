//! Schema steps for the decrypted-file cache.
//!
//! `PRAGMA user_version` holds the number of the last step applied. Each
//! pending step runs in its own transaction together with the version bump, so
//! a crash mid-upgrade leaves the cache at the previous step.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

const STEPS: &[(u32, &str, Step)] = &[(1, "file_cache table", v001_initial::up)];

fn latest() -> u32 {
    STEPS.last().map_or(0, |(step, ..)| *step)
}

pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the cache schema up to date. A cache written by a newer build is
/// refused rather than guessed at.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found = schema_version(conn)?;
    let target = latest();
    if found > target {
        return Err(StoreError::Migration(format!(
            "cache schema v{found} is newer than supported v{target}"
        )));
    }

    for &(step, name, up) in STEPS.iter().filter(|(step, ..)| *step > found) {
        tracing::info!(step, name, "Upgrading file cache schema");
        let tx = conn.unchecked_transaction()?;
        up(&tx).map_err(|e| StoreError::Migration(format!("step {step} ({name}): {e}")))?;
        tx.pragma_update(None, "user_version", step)?;
        tx.commit()?;
    }

    tracing::debug!(version = target, "File cache schema ready");
    Ok(())
}
