//! Per-client audit log.
//!
//! Records every proxied exchange: plain requests with method and status,
//! tunnel establishments, and blocked hosts. Entries append to one log file
//! and accumulate per client for report retrieval. Logging is best-effort;
//! a failed append never affects the exchange being served.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only audit log shared by all connection handlers.
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

struct AuditInner {
    file: Mutex<File>,
    clients: Mutex<HashMap<IpAddr, Vec<String>>>,
}

impl AuditLog {
    /// Opens (or creates) the audit log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            inner: Arc::new(AuditInner {
                file: Mutex::new(file),
                clients: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Records one proxied HTTP exchange.
    pub fn log_request(
        &self,
        client: IpAddr,
        domain: &str,
        path: &str,
        method: &str,
        status: Option<u16>,
    ) {
        let status = status.map_or_else(|| "-".to_string(), |code| code.to_string());
        let entry = format!(
            "{}, IP: {}, Domain: {}, Resource path: {}, Method: {}, Response: {}",
            Local::now().format(TIMESTAMP_FORMAT),
            client,
            domain,
            path,
            method,
            status
        );
        self.append_client(client, entry);
    }

    /// Records a newly established HTTPS tunnel.
    pub fn log_tunnel(&self, client: IpAddr, hostname: &str) {
        let entry = format!(
            "{}, IP: {}, Domain: {}, Connection: HTTPS",
            Local::now().format(TIMESTAMP_FORMAT),
            client,
            hostname
        );
        self.append_client(client, entry);
    }

    /// Records a connection dropped because the host is blocked.
    pub fn log_blocked(&self, client: IpAddr, hostname: &str) {
        let entry = format!(
            "{}, IP: {}, Domain: {}, Connection: BLOCKED",
            Local::now().format(TIMESTAMP_FORMAT),
            client,
            hostname
        );
        self.append_client(client, entry);
    }

    /// Records a free-form diagnostic line, not attributed to a client.
    pub fn log_verbose(&self, message: &str) {
        let entry = format!("{}, {}", Local::now().format(TIMESTAMP_FORMAT), message);
        self.append_global(entry);
    }

    /// The recorded entries for one client, in emission order.
    pub fn client_report(&self, client: IpAddr) -> Vec<String> {
        self.inner
            .clients
            .lock()
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    fn append_client(&self, client: IpAddr, entry: String) {
        self.inner
            .clients
            .lock()
            .entry(client)
            .or_default()
            .push(entry.clone());
        self.append_global(entry);
    }

    fn append_global(&self, entry: String) {
        let mut file = self.inner.file.lock();
        if let Err(e) = writeln!(file, "{entry}") {
            warn!("audit log append failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    fn open_log(dir: &TempDir) -> AuditLog {
        AuditLog::open(dir.path().join("audit.log")).unwrap()
    }

    #[test]
    fn request_entries_carry_all_fields_in_order() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.log_request(client(), "example.com", "/index.html", "GET", Some(200));
        log.log_tunnel(client(), "secure.example");

        let report = log.client_report(client());
        assert_eq!(report.len(), 2);
        assert!(report[0].contains("IP: 10.0.0.7"));
        assert!(report[0].contains("Domain: example.com"));
        assert!(report[0].contains("Resource path: /index.html"));
        assert!(report[0].contains("Method: GET"));
        assert!(report[0].ends_with("Response: 200"));
        assert!(report[1].ends_with("Connection: HTTPS"));
    }

    #[test]
    fn blocked_and_unparsed_status_render() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.log_blocked(client(), "bad.example");
        log.log_request(client(), "example.com", "/", "GET", None);

        let report = log.client_report(client());
        assert!(report[0].ends_with("Connection: BLOCKED"));
        assert!(report[1].ends_with("Response: -"));
    }

    #[test]
    fn entries_land_in_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::open(&path).unwrap();

        log.log_request(client(), "example.com", "/", "GET", Some(200));
        log.log_verbose("closing HTTPS connection for example.com");

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("Method: GET"));
        assert!(contents.contains("closing HTTPS connection"));
    }

    #[test]
    fn reports_are_per_client() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let other: IpAddr = "10.0.0.8".parse().unwrap();

        log.log_request(client(), "example.com", "/", "GET", Some(200));
        log.log_request(other, "other.example", "/", "GET", Some(404));

        assert_eq!(log.client_report(client()).len(), 1);
        assert_eq!(log.client_report(other).len(), 1);
        assert!(log.client_report("10.0.0.9".parse().unwrap()).is_empty());
    }
}
