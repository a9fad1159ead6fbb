//! Cache index repository.

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::CacheEntry;

/// Repository for cache index operations.
pub struct CacheIndexRepo;

impl CacheIndexRepo {
    /// Insert or refresh a cache entry's freshness token.
    pub fn upsert(conn: &Connection, key: &str, last_modified: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO cache_index (key, last_modified) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET
                 last_modified = excluded.last_modified,
                 updated_at = datetime('now')",
            params![key, last_modified],
        )?;
        Ok(())
    }

    /// The freshness token for a key, if cached.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        let token = conn
            .query_row(
                "SELECT last_modified FROM cache_index WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .ok();
        Ok(token)
    }

    /// Remove a cache entry.
    pub fn remove(conn: &Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM cache_index WHERE key = ?1", [key])?;
        Ok(())
    }

    /// All cache entries.
    pub fn get_all(conn: &Connection) -> Result<Vec<CacheEntry>> {
        let mut stmt = conn.prepare("SELECT key, last_modified FROM cache_index")?;

        let entries = stmt
            .query_map([], |row| {
                Ok(CacheEntry {
                    key: row.get(0)?,
                    last_modified: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn upsert_and_get() {
        let conn = test_conn();
        CacheIndexRepo::upsert(&conn, "example.com%2Findex", "Mon, 01 Jan 2024 00:00:00 GMT")
            .unwrap();

        let token = CacheIndexRepo::get(&conn, "example.com%2Findex").unwrap();
        assert_eq!(token.as_deref(), Some("Mon, 01 Jan 2024 00:00:00 GMT"));
        assert_eq!(CacheIndexRepo::get(&conn, "missing").unwrap(), None);
    }

    #[test]
    fn upsert_replaces_token() {
        let conn = test_conn();
        CacheIndexRepo::upsert(&conn, "k", "t1").unwrap();
        CacheIndexRepo::upsert(&conn, "k", "t2").unwrap();

        assert_eq!(CacheIndexRepo::get(&conn, "k").unwrap().as_deref(), Some("t2"));
        assert_eq!(CacheIndexRepo::get_all(&conn).unwrap().len(), 1);
    }

    #[test]
    fn remove_clears_entry() {
        let conn = test_conn();
        CacheIndexRepo::upsert(&conn, "k", "t").unwrap();
        CacheIndexRepo::remove(&conn, "k").unwrap();
        assert_eq!(CacheIndexRepo::get(&conn, "k").unwrap(), None);
    }
}
