//! TLS ClientHello inspection.
//!
//! Extracts the SNI hostname from the first TLS record of a connection
//! without terminating TLS. Every byte consumed is retained so the record
//! can be forwarded verbatim once the upstream is resolved; the sniffer
//! observes, it never re-encodes. Only an unfragmented ClientHello in the
//! first record is recognized; anything else reads as "no SNI".

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time;

/// TLS record type for handshake messages.
pub const TLS_HANDSHAKE: u8 = 0x16;
/// Handshake message type for ClientHello.
pub const CLIENT_HELLO: u8 = 0x01;

const SERVER_NAME_EXT: u16 = 0x0000;
// TLS plaintext records carry at most 2^14 bytes of payload.
const MAX_RECORD_LEN: usize = 16384;

/// The retained preamble of a sniffed connection plus the hostname, if any.
#[derive(Debug)]
pub struct SniffedHello {
    /// Every byte read off the stream, forwardable byte-for-byte.
    pub buffered: Vec<u8>,
    /// The SNI hostname, when the preamble was a ClientHello carrying one.
    pub hostname: Option<String>,
}

/// Reads the first TLS record from `reader` and extracts the SNI hostname.
///
/// `buffered` carries bytes the caller already consumed (the CONNECT probe);
/// they are treated as the start of the record. A preamble that is not a
/// ClientHello, a truncated record, or a quiet peer yields `hostname: None`
/// with whatever bytes were read still in `buffered` — sniff failures are
/// not fatal to the connection.
pub async fn sniff_client_hello<R>(
    reader: &mut R,
    mut buffered: Vec<u8>,
    timeout: Duration,
) -> std::io::Result<SniffedHello>
where
    R: AsyncRead + Unpin,
{
    // Record header: type (1), version (2), length (2).
    if !fill_to(reader, &mut buffered, 5, timeout).await? {
        return Ok(SniffedHello {
            buffered,
            hostname: None,
        });
    }
    if buffered[0] != TLS_HANDSHAKE {
        return Ok(SniffedHello {
            buffered,
            hostname: None,
        });
    }

    let record_len = u16::from_be_bytes([buffered[3], buffered[4]]) as usize;
    if record_len == 0 || record_len > MAX_RECORD_LEN {
        return Ok(SniffedHello {
            buffered,
            hostname: None,
        });
    }
    if !fill_to(reader, &mut buffered, 5 + record_len, timeout).await? {
        return Ok(SniffedHello {
            buffered,
            hostname: None,
        });
    }

    let hostname = ClientHelloView::new(&buffered[5..5 + record_len]).server_name();
    if let Some(name) = &hostname {
        tracing::debug!(hostname = %name, "sniffed SNI hostname");
    }
    Ok(SniffedHello { buffered, hostname })
}

/// Reads until `buf` holds at least `target` bytes. Returns `Ok(false)` on
/// EOF or timeout, keeping whatever arrived in `buf`.
async fn fill_to<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    target: usize,
    timeout: Duration,
) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 512];
    while buf.len() < target {
        let want = (target - buf.len()).min(scratch.len());
        let read = match time::timeout(timeout, reader.read(&mut scratch[..want])).await {
            Ok(Ok(0)) => return Ok(false),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(false),
        };
        buf.extend_from_slice(&scratch[..read]);
    }
    Ok(true)
}

/// Read-only cursor over the handshake bytes of one TLS record.
///
/// Walks the fixed ClientHello layout to the extensions block and scans for
/// the server_name extension. Never writes; all bounds are checked, so a
/// truncated or lying record reads as `None`.
#[derive(Debug)]
pub struct ClientHelloView<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ClientHelloView<'a> {
    /// Creates a view over the record payload (the bytes after the 5-byte
    /// record header).
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Locates the server_name extension and returns its hostname.
    pub fn server_name(mut self) -> Option<String> {
        // Handshake header: type (1), length (3).
        if self.u8()? != CLIENT_HELLO {
            return None;
        }
        self.skip(3)?;
        // Protocol version (2) + client random (32).
        self.skip(2 + 32)?;

        let session_id = self.u8()? as usize;
        self.skip(session_id)?;
        let cipher_suites = self.u16()? as usize;
        self.skip(cipher_suites)?;
        let compressions = self.u8()? as usize;
        self.skip(compressions)?;

        let extensions_total = self.u16()? as usize;
        let extensions_end = self.pos.checked_add(extensions_total)?.min(self.data.len());
        while self.pos + 4 <= extensions_end {
            let ext_type = self.u16()?;
            let ext_len = self.u16()? as usize;
            if ext_type == SERVER_NAME_EXT {
                // server_name_list length (2), entry type (1), hostname
                // length (2), hostname bytes.
                self.skip(2)?;
                if self.u8()? != 0x00 {
                    return None;
                }
                let name_len = self.u16()? as usize;
                let name = self.take(name_len)?;
                return String::from_utf8(name.to_vec()).ok();
            }
            self.skip(ext_len)?;
        }
        None
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = *self.data.get(self.pos)?;
        let lo = *self.data.get(self.pos + 1)?;
        self.pos += 2;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        let next = self.pos.checked_add(n)?;
        if next > self.data.len() {
            return None;
        }
        self.pos = next;
        Some(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let next = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..next)?;
        self.pos = next;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    // A real TLS 1.3 ClientHello for example.ulfheim.net.
    const HELLO: &[u8] = b"\x16\x03\x01\x00\xf8\x01\x00\x00\xf4\x03\x03\x00\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10\x11\x12\x13\x14\x15\x16\x17\x18\x19\x1a\x1b\x1c\x1d\x1e\x1f\x20\xe0\xe1\xe2\xe3\xe4\xe5\xe6\xe7\xe8\xe9\xea\xeb\xec\xed\xee\xef\xf0\xf1\xf2\xf3\xf4\xf5\xf6\xf7\xf8\xf9\xfa\xfb\xfc\xfd\xfe\xff\x00\x08\x13\x02\x13\x03\x13\x01\x00\xff\x01\x00\x00\xa3\x00\x00\x00\x18\x00\x16\x00\x00\x13\x65\x78\x61\x6d\x70\x6c\x65\x2e\x75\x6c\x66\x68\x65\x69\x6d\x2e\x6e\x65\x74\x00\x0b\x00\x04\x03\x00\x01\x02\x00\x0a\x00\x16\x00\x14\x00\x1d\x00\x17\x00\x1e\x00\x19\x00\x18\x01\x00\x01\x01\x01\x02\x01\x03\x01\x04\x00\x23\x00\x00\x00\x16\x00\x00\x00\x17\x00\x00\x00\x0d\x00\x1e\x00\x1c\x04\x03\x05\x03\x06\x03\x08\x07\x08\x08\x08\x09\x08\x0a\x08\x0b\x08\x04\x08\x05\x08\x06\x04\x01\x05\x01\x06\x01\x00\x2b\x00\x03\x02\x03\x04\x00\x2d\x00\x02\x01\x01\x00\x33\x00\x26\x00\x24\x00\x1d\x00\x20\x35\x80\x72\xd6\x36\x58\x80\xd1\xae\xea\x32\x9a\xdf\x91\x21\x38\x38\x51\xed\x21\xa2\x8e\x3b\x75\xe9\x65\xd0\xd2\xcd\x16\x62\x54";

    #[tokio::test]
    async fn extracts_sni_hostname() {
        let mut data = HELLO;
        let sniffed = sniff_client_hello(&mut data, Vec::new(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(sniffed.hostname.as_deref(), Some("example.ulfheim.net"));
        // All record bytes retained for forwarding.
        assert_eq!(sniffed.buffered, HELLO);
    }

    #[tokio::test]
    async fn pre_read_probe_bytes_count_toward_the_record() {
        // The tunnel handler reads 7 bytes checking for CONNECT before
        // handing off to the sniffer.
        let mut rest = &HELLO[7..];
        let sniffed = sniff_client_hello(&mut rest, HELLO[..7].to_vec(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(sniffed.hostname.as_deref(), Some("example.ulfheim.net"));
        assert_eq!(sniffed.buffered, HELLO);
    }

    #[tokio::test]
    async fn non_tls_preamble_has_no_sni() {
        let mut data: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        let sniffed = sniff_client_hello(&mut data, Vec::new(), TIMEOUT)
            .await
            .unwrap();

        assert!(sniffed.hostname.is_none());
        assert_eq!(&sniffed.buffered, b"GET /");
    }

    #[tokio::test]
    async fn truncated_record_has_no_sni() {
        let mut data = &HELLO[..40];
        let sniffed = sniff_client_hello(&mut data, Vec::new(), TIMEOUT)
            .await
            .unwrap();

        assert!(sniffed.hostname.is_none());
        assert_eq!(sniffed.buffered, &HELLO[..40]);
    }

    /// Builds a minimal ClientHello record, optionally carrying SNI after a
    /// padding extension (so the scan has something to skip).
    fn build_client_hello(sni: Option<&str>) -> Vec<u8> {
        let mut hello = Vec::new();
        hello.extend_from_slice(&[0x03, 0x03]); // protocol version
        hello.extend_from_slice(&[0u8; 32]); // client random
        hello.push(0x00); // session id length
        hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher suites
        hello.extend_from_slice(&[0x01, 0x00]); // compression methods

        let mut extensions = Vec::new();
        // Padding extension (type 0x0015): must be skipped.
        extensions.extend_from_slice(&[0x00, 0x15, 0x00, 0x03, 0x00, 0x00, 0x00]);
        if let Some(name) = sni {
            let name_len = name.len() as u16;
            extensions.extend_from_slice(&[0x00, 0x00]); // server_name type
            extensions.extend_from_slice(&(name_len + 5).to_be_bytes());
            extensions.extend_from_slice(&(name_len + 3).to_be_bytes()); // list length
            extensions.push(0x00); // entry type: host_name
            extensions.extend_from_slice(&name_len.to_be_bytes());
            extensions.extend_from_slice(name.as_bytes());
        }
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut record = vec![0x16, 0x03, 0x01]; // handshake record header
        let handshake_len = hello.len() as u32;
        record.extend_from_slice(&((handshake_len + 4) as u16).to_be_bytes());
        record.push(CLIENT_HELLO);
        record.extend_from_slice(&handshake_len.to_be_bytes()[1..]); // 3-byte length
        record.extend_from_slice(&hello);
        record
    }

    #[tokio::test]
    async fn synthetic_hello_with_sni_yields_exact_hostname() {
        let record = build_client_hello(Some("example.com"));
        let mut data = record.as_slice();
        let sniffed = sniff_client_hello(&mut data, Vec::new(), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(sniffed.hostname.as_deref(), Some("example.com"));
        assert_eq!(sniffed.buffered, record);
    }

    #[tokio::test]
    async fn synthetic_hello_without_sni_yields_none() {
        let record = build_client_hello(None);
        let mut data = record.as_slice();
        let sniffed = sniff_client_hello(&mut data, Vec::new(), TIMEOUT)
            .await
            .unwrap();

        assert!(sniffed.hostname.is_none());
        // The record is still intact for forwarding.
        assert_eq!(sniffed.buffered, record);
    }

    #[test]
    fn view_rejects_non_client_hello_handshake() {
        // Handshake type 0x02 (ServerHello).
        let mut record = HELLO[5..].to_vec();
        record[0] = 0x02;
        assert!(ClientHelloView::new(&record).server_name().is_none());
    }

    #[test]
    fn view_without_sni_extension_returns_none() {
        // Strip everything after the compression methods: no extensions.
        // session id (0x20 bytes at offset 38), ciphers, compression follow;
        // easiest honest case is a record that simply ends early.
        let record = &HELLO[5..80];
        assert!(ClientHelloView::new(record).server_name().is_none());
    }
}
