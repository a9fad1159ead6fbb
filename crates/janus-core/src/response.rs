//! Canned client-facing error responses.

use chrono::Utc;

/// Server field advertised in generated responses.
pub const SERVER_NAME: &str = "janus";

/// Status lines the proxy generates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// 400 — framing or target resolution failed.
    BadRequest,
    /// 401 — destination host is blocked.
    Unauthorized,
    /// 405 — method outside GET/HEAD/POST/OPTIONS.
    MethodNotAllowed,
    /// 413 — header block exceeded the buffer limit.
    ContentTooLarge,
    /// 500 — unexpected internal failure.
    InternalError,
    /// 502 — upstream sent an unusable response.
    BadGateway,
}

impl ProxyStatus {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        match self {
            ProxyStatus::BadRequest => 400,
            ProxyStatus::Unauthorized => 401,
            ProxyStatus::MethodNotAllowed => 405,
            ProxyStatus::ContentTooLarge => 413,
            ProxyStatus::InternalError => 500,
            ProxyStatus::BadGateway => 502,
        }
    }

    /// Reason phrase.
    pub fn reason(self) -> &'static str {
        match self {
            ProxyStatus::BadRequest => "Bad Request",
            ProxyStatus::Unauthorized => "Unauthorized",
            ProxyStatus::MethodNotAllowed => "Method Not Allowed",
            ProxyStatus::ContentTooLarge => "Content Too Large",
            ProxyStatus::InternalError => "Internal Server Error",
            ProxyStatus::BadGateway => "Bad Gateway",
        }
    }
}

/// Builds the full wire bytes of a minimal HTML error response.
pub fn error_response(status: ProxyStatus) -> Vec<u8> {
    let html = format!(
        "<html><body><h1>{} {}</h1></body></html>\r\n",
        status.code(),
        status.reason()
    );
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    format!(
        "HTTP/1.1 {} {}\r\nDate: {}\r\nServer: {}\r\nContent-Length: {}\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{}",
        status.code(),
        status.reason(),
        date,
        SERVER_NAME,
        html.len(),
        html
    )
    .into_bytes()
}
