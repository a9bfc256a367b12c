//! Request head parsing and Host normalisation

use thiserror::Error;
use tracing::trace;

/// Largest request head the router buffers before giving up
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Malformed request head: {0}")]
    Malformed(String),

    #[error("Request head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,
}

/// The parts of a request head the router needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Normalised Host header, if present and non-empty
    pub host: Option<String>,
    /// Byte length of the head including the blank line
    pub head_len: usize,
}

/// Parse a buffered request head
///
/// Returns `Ok(None)` while the head is still incomplete.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, HostError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(normalize_host);

            let head = RequestHead {
                method: req.method.unwrap_or("").to_string(),
                path: req.path.unwrap_or("").to_string(),
                host,
                head_len,
            };
            trace!(method = %head.method, path = %head.path, host = ?head.host, "Parsed request head");
            Ok(Some(head))
        }
        Ok(httparse::Status::Partial) if buf.len() >= MAX_HEAD_SIZE => Err(HostError::TooLarge),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(HostError::Malformed(e.to_string())),
    }
}

/// Lowercase a Host value and strip any port
///
/// `Foo.example.com:8443` → `foo.example.com`, `[::1]:80` → `[::1]`.
pub fn normalize_host(value: &str) -> Option<String> {
    let value = value.trim();

    let host = if value.starts_with('[') {
        // IPv6 literal keeps its brackets
        let end = value.find(']')?;
        &value[..=end]
    } else {
        match value.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => value,
        }
    };

    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}
