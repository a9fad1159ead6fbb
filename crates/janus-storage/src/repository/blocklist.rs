//! Block-list repository.

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::BlockedHost;

/// Repository for block-list operations.
pub struct BlocklistRepo;

impl BlocklistRepo {
    /// Insert or refresh a blocked host.
    pub fn insert(conn: &Connection, entry: &BlockedHost) -> Result<()> {
        conn.execute(
            "INSERT INTO blocked_hosts (hostname, ip) VALUES (?1, ?2)
             ON CONFLICT(hostname) DO UPDATE SET ip = excluded.ip",
            params![entry.hostname, entry.ip],
        )?;
        Ok(())
    }

    /// True if the value matches a blocked hostname or recorded IP.
    pub fn contains(conn: &Connection, host_or_ip: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocked_hosts WHERE hostname = ?1 OR ip = ?1",
            [host_or_ip],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Remove a blocked hostname. Returns true if an entry existed.
    pub fn remove(conn: &Connection, hostname: &str) -> Result<bool> {
        let changed = conn.execute(
            "DELETE FROM blocked_hosts WHERE hostname = ?1",
            [hostname],
        )?;
        Ok(changed > 0)
    }

    /// All blocked hosts, ordered by hostname.
    pub fn get_all(conn: &Connection) -> Result<Vec<BlockedHost>> {
        let mut stmt =
            conn.prepare("SELECT hostname, ip FROM blocked_hosts ORDER BY hostname ASC")?;

        let entries = stmt
            .query_map([], |row| {
                Ok(BlockedHost {
                    hostname: row.get(0)?,
                    ip: row.get(1)?,
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
    fn insert_and_contains() {
        let conn = test_conn();
        BlocklistRepo::insert(
            &conn,
            &BlockedHost {
                hostname: "example.com".into(),
                ip: "93.184.216.34".into(),
            },
        )
        .unwrap();

        assert!(BlocklistRepo::contains(&conn, "example.com").unwrap());
        assert!(BlocklistRepo::contains(&conn, "93.184.216.34").unwrap());
        assert!(!BlocklistRepo::contains(&conn, "other.example").unwrap());
    }

    #[test]
    fn insert_twice_updates_ip() {
        let conn = test_conn();
        let mut entry = BlockedHost {
            hostname: "example.com".into(),
            ip: "1.1.1.1".into(),
        };
        BlocklistRepo::insert(&conn, &entry).unwrap();
        entry.ip = "2.2.2.2".into();
        BlocklistRepo::insert(&conn, &entry).unwrap();

        let all = BlocklistRepo::get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip, "2.2.2.2");
    }

    #[test]
    fn remove_reports_existence() {
        let conn = test_conn();
        BlocklistRepo::insert(
            &conn,
            &BlockedHost {
                hostname: "example.com".into(),
                ip: String::new(),
            },
        )
        .unwrap();

        assert!(BlocklistRepo::remove(&conn, "example.com").unwrap());
        assert!(!BlocklistRepo::remove(&conn, "example.com").unwrap());
    }
}
