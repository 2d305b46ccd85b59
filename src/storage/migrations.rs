//! Database migrations for the vaultsync state database

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < SCHEMA_VERSION {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Initial schema (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per synced path. Root and folder pages use keys ending in '/'.
        CREATE TABLE IF NOT EXISTS bindings (
            path TEXT PRIMARY KEY,
            remote_page_id TEXT NOT NULL,
            remote_version INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            last_synced_at TEXT NOT NULL
        );

        -- At most one live binding per remote page
        CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_remote_page_id
            ON bindings(remote_page_id);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;
    Ok(())
}
