//! Binding queries against the state database

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, SyncError};
use crate::types::Binding;

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Store(format!("invalid last_synced_at '{}': {}", raw, e)))
}

/// Row as stored, before the timestamp is parsed
struct RawBinding {
    path: String,
    remote_page_id: String,
    remote_version: i64,
    content_hash: String,
    last_synced_at: String,
}

fn row_to_raw(row: &Row) -> rusqlite::Result<RawBinding> {
    Ok(RawBinding {
        path: row.get("path")?,
        remote_page_id: row.get("remote_page_id")?,
        remote_version: row.get("remote_version")?,
        content_hash: row.get("content_hash")?,
        last_synced_at: row.get("last_synced_at")?,
    })
}

fn finish(raw: RawBinding) -> Result<Binding> {
    Ok(Binding {
        last_synced_at: parse_timestamp(&raw.last_synced_at)?,
        path: raw.path,
        remote_page_id: raw.remote_page_id,
        remote_version: raw.remote_version,
        content_hash: raw.content_hash,
    })
}

/// Load every binding, ordered by path
pub fn list_bindings(conn: &Connection) -> Result<Vec<Binding>> {
    let mut stmt = conn.prepare(
        "SELECT path, remote_page_id, remote_version, content_hash, last_synced_at
         FROM bindings ORDER BY path",
    )?;
    let rows = stmt.query_map([], row_to_raw)?;

    let mut bindings = Vec::new();
    for row in rows {
        bindings.push(finish(row?)?);
    }
    Ok(bindings)
}

/// Create or replace the binding for `binding.path`.
///
/// If a different path currently owns the same remote page id, ownership is
/// transferred: that row is removed so the unique index holds. Returns the
/// displaced path, if any. Must run inside a transaction.
pub fn upsert_binding(conn: &Connection, binding: &Binding) -> Result<Option<String>> {
    let displaced: Option<String> = conn
        .query_row(
            "SELECT path FROM bindings WHERE remote_page_id = ? AND path != ?",
            params![binding.remote_page_id, binding.path],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(ref other) = displaced {
        conn.execute("DELETE FROM bindings WHERE path = ?", params![other])?;
    }

    conn.execute(
        r#"
        INSERT INTO bindings (path, remote_page_id, remote_version, content_hash, last_synced_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            remote_page_id = excluded.remote_page_id,
            remote_version = excluded.remote_version,
            content_hash = excluded.content_hash,
            last_synced_at = excluded.last_synced_at
        "#,
        params![
            binding.path,
            binding.remote_page_id,
            binding.remote_version,
            binding.content_hash,
            binding.last_synced_at.to_rfc3339(),
        ],
    )?;

    Ok(displaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn by_path(conn: &Connection, path: &str) -> Option<Binding> {
        list_bindings(conn)
            .unwrap()
            .into_iter()
            .find(|b| b.path == path)
    }

    fn by_remote_id(conn: &Connection, id: &str) -> Option<Binding> {
        list_bindings(conn)
            .unwrap()
            .into_iter()
            .find(|b| b.remote_page_id == id)
    }

    fn binding(path: &str, id: &str, version: i64) -> Binding {
        Binding {
            path: path.to_string(),
            remote_page_id: id.to_string(),
            remote_version: version,
            content_hash: format!("hash-{}", version),
            last_synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = conn();
        upsert_binding(&conn, &binding("notes/a.md", "42", 1)).unwrap();

        let found = by_path(&conn, "notes/a.md").unwrap();
        assert_eq!(found.remote_page_id, "42");
        assert_eq!(found.remote_version, 1);

        upsert_binding(&conn, &binding("notes/a.md", "42", 2)).unwrap();
        let found = by_path(&conn, "notes/a.md").unwrap();
        assert_eq!(found.remote_version, 2);
        assert_eq!(list_bindings(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_list_bindings_is_ordered_by_path() {
        let conn = conn();
        upsert_binding(&conn, &binding("b.md", "2", 1)).unwrap();
        upsert_binding(&conn, &binding("Guides/", "3", 1)).unwrap();
        upsert_binding(&conn, &binding("a.md", "1", 1)).unwrap();

        let paths: Vec<String> = list_bindings(&conn)
            .unwrap()
            .into_iter()
            .map(|b| b.path)
            .collect();
        assert_eq!(paths, vec!["Guides/", "a.md", "b.md"]);
        assert!(by_remote_id(&conn, "4").is_none());
    }

    #[test]
    fn test_rebinding_transfers_remote_id() {
        let conn = conn();
        upsert_binding(&conn, &binding("old.md", "7", 3)).unwrap();

        let displaced = upsert_binding(&conn, &binding("new.md", "7", 4)).unwrap();
        assert_eq!(displaced.as_deref(), Some("old.md"));
        assert!(by_path(&conn, "old.md").is_none());
        assert_eq!(
            by_remote_id(&conn, "7").unwrap().path,
            "new.md"
        );
    }

    #[test]
    fn test_timestamp_round_trip_keeps_precision() {
        let conn = conn();
        let original = binding("a.md", "1", 1);
        upsert_binding(&conn, &original).unwrap();
        let found = by_path(&conn, "a.md").unwrap();
        assert_eq!(found.last_synced_at, original.last_synced_at);
    }
}
