//! Request and response header model.
//!
//! Mirrors the wire format: a start line plus `Key: Value` fields. Field
//! storage is a plain `HashMap` with unique, case-sensitive keys: a repeated
//! field overwrites the earlier one and iteration order is not guaranteed,
//! so `serialize` reproduces the field *set*, not the original field order.

use std::collections::HashMap;

use url::Url;

use crate::error::FrameError;

/// Field mapping of one header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: HashMap<String, String>,
}

impl FieldMap {
    /// Parses the field lines of a header block (everything after the start
    /// line). Each line splits on the first colon; one leading space of the
    /// value is trimmed. Lines without a colon are skipped.
    pub fn parse(block: &str) -> Self {
        let mut fields = HashMap::new();
        for line in block.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.strip_prefix(' ').unwrap_or(value);
            fields.insert(key.to_string(), value.to_string());
        }
        Self { fields }
    }

    /// Looks up a field by exact name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// True if the field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Inserts or overwrites a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over `(name, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Writes one `Key: Value\r\n` line per field plus the trailing blank
    /// line that terminates a header block.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// A parsed request header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    method: String,
    target: String,
    version: String,
    fields: FieldMap,
}

impl RequestHeader {
    /// Parses a raw header block.
    ///
    /// The start line splits on its first two spaces into method, target,
    /// and version; everything after the first CRLF goes to field parsing.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let line_end = raw.find("\r\n").unwrap_or(raw.len());
        let start_line = &raw[..line_end];
        let rest = raw.get(line_end + 2..).unwrap_or("");

        let malformed = || FrameError::MalformedStartLine(start_line.to_string());
        let (method, after) = start_line.split_once(' ').ok_or_else(malformed)?;
        let (target, version) = after.split_once(' ').ok_or_else(malformed)?;
        if method.is_empty() || target.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            fields: FieldMap::parse(rest),
        })
    }

    /// The request method token, as sent.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw request target (absolute URL or origin-form path).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The protocol version token.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The field mapping.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Resolves the request target to an absolute URL.
    ///
    /// Absolute targets are used as-is. Origin-form targets are combined
    /// with the `Host` field; without one the target is unresolvable.
    pub fn resolve_url(&self) -> Result<Url, FrameError> {
        if let Ok(url) = Url::parse(&self.target) {
            if url.has_host() {
                return Ok(url);
            }
        }
        let host = self
            .fields
            .get("Host")
            .ok_or(FrameError::UnresolvableTarget)?;
        let absolute = format!("http://{}{}", host, self.target);
        Url::parse(&absolute).map_err(|_| FrameError::UnresolvableTarget)
    }

    /// Returns a rebuilt copy with one field inserted or overwritten.
    /// The original block is left untouched.
    pub fn with_field(&self, key: &str, value: &str) -> Self {
        let mut copy = self.clone();
        copy.fields.insert(key, value);
        copy
    }

    /// Reproduces the wire form: start line, one line per field, blank line.
    pub fn serialize(&self) -> String {
        format!(
            "{} {} {}\r\n{}",
            self.method,
            self.target,
            self.version,
            self.fields.serialize()
        )
    }
}

/// A leniently parsed response header block.
///
/// Relaying must forward whatever the origin sent, so parsing extracts only
/// what the proxy itself needs (status code, body framing fields) and keeps
/// the verbatim bytes for forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    raw: String,
    status: Option<u16>,
    fields: FieldMap,
}

impl ResponseHead {
    /// Parses a raw response header block.
    pub fn parse(raw: &str) -> Self {
        let line_end = raw.find("\r\n").unwrap_or(raw.len());
        let status = raw[..line_end]
            .split(' ')
            .nth(1)
            .and_then(|code| code.get(..3))
            .and_then(|code| code.parse::<u16>().ok());
        let rest = raw.get(line_end + 2..).unwrap_or("");

        Self {
            raw: raw.to_string(),
            status,
            fields: FieldMap::parse(rest),
        }
    }

    /// The status code, if the status line carried a parseable one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The verbatim header bytes, for forwarding.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The field mapping.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// The declared body length, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.fields
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// True if the body uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.fields
            .get("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}
