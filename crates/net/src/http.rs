//! A minimal HTTP/1.1 request/response codec (spec.md §4.2).
//!
//! There is no teacher analog for speaking HTTP over vsock; this is
//! hand-rolled against plain byte slices, deliberately, because the
//! client needs exact control over how a response is read (half-close
//! the write side, read to EOF — §4.2: "the codec never buffers
//! unlimited input"), which rules out pulling in a full HTTP client
//! stack for this one leg.

use crate::error::ClientError;

/// An ordered header map with case-insensitive last-write-wins semantics
/// (spec.md §4.2: "duplicate keys use last-write-wins").
#[derive(Debug, Clone, Default)]
pub struct HeaderMap(Vec<(String, String)>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self
            .0
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            existing.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Builds an HTTP/1.1 request. `Host: localhost` and `Connection: close`
/// are always present; caller-supplied headers of the same name override
/// them (last-write-wins, spec.md §4.2).
pub fn build_request(
    method: &str,
    path: &str,
    mut headers: HeaderMap,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let mut defaults = HeaderMap::new();
    defaults.insert("Host", "localhost");
    defaults.insert("Connection", "close");
    for (k, v) in headers.iter() {
        defaults.insert(k, v);
    }
    headers = defaults;

    if let Some(body) = body {
        headers.insert("Content-Length", body.len().to_string());
    }

    let mut out = Vec::new();
    out.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}

/// A response with its body interpreted as UTF-8 text.
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub status: u16,
    pub body_text: Option<String>,
}

/// A response with binary body bytes and a parsed header map.
#[derive(Debug, Clone)]
pub struct BinaryResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

const SEPARATOR: &[u8] = b"\r\n\r\n";

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes.windows(SEPARATOR.len()).position(|w| w == SEPARATOR)
}

fn parse_status_line(line: &str) -> Result<u16, ClientError> {
    let mut parts = line.split_whitespace();
    let _version = parts
        .next()
        .ok_or_else(|| ClientError::DecodingError("missing HTTP version".into()))?;
    let status = parts
        .next()
        .ok_or_else(|| ClientError::DecodingError("missing status code".into()))?;
    status
        .parse()
        .map_err(|_| ClientError::DecodingError(format!("invalid status code: {status}")))
}

/// Parses a response, treating everything after the header/body
/// separator as UTF-8 text (spec.md §4.2).
pub fn parse_response(bytes: &[u8]) -> Result<TextResponse, ClientError> {
    let sep = find_separator(bytes)
        .ok_or_else(|| ClientError::DecodingError("missing header/body separator".into()))?;
    let head = std::str::from_utf8(&bytes[..sep])
        .map_err(|e| ClientError::DecodingError(e.to_string()))?;
    let status_line = head
        .lines()
        .next()
        .ok_or_else(|| ClientError::DecodingError("empty response head".into()))?;
    let status = parse_status_line(status_line)?;

    let body_bytes = &bytes[sep + SEPARATOR.len()..];
    let body_text = if body_bytes.is_empty() {
        None
    } else {
        Some(
            std::str::from_utf8(body_bytes)
                .map_err(|e| ClientError::DecodingError(e.to_string()))?
                .to_string(),
        )
    };

    Ok(TextResponse { status, body_text })
}

/// Parses a response, preserving a binary body and returning a
/// case-insensitive header map (spec.md §4.2).
pub fn parse_response_binary(bytes: &[u8]) -> Result<BinaryResponse, ClientError> {
    let sep = find_separator(bytes)
        .ok_or_else(|| ClientError::DecodingError("missing header/body separator".into()))?;
    let head = std::str::from_utf8(&bytes[..sep])
        .map_err(|e| ClientError::DecodingError(e.to_string()))?;
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| ClientError::DecodingError("empty response head".into()))?;
    let status = parse_status_line(status_line)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim(), value.trim());
        }
    }

    let body_bytes = &bytes[sep + SEPARATOR.len()..];
    let body = if body_bytes.is_empty() {
        None
    } else {
        Some(body_bytes.to_vec())
    };

    Ok(BinaryResponse {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_includes_mandatory_headers() {
        let req = build_request("GET", "/api/v1/urls", HeaderMap::new(), None);
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("GET /api/v1/urls HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn build_request_sets_content_length_when_body_present() {
        let body = b"hello";
        let req = build_request("POST", "/api/v1/clipboard", HeaderMap::new(), Some(body));
        let text = String::from_utf8(req).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn build_request_last_write_wins_on_duplicate_header() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Batch-ID", "first");
        headers.insert("X-Batch-ID", "second");
        let req = build_request("POST", "/x", headers, None);
        let text = String::from_utf8(req).unwrap();
        assert!(text.contains("X-Batch-ID: second"));
        assert!(!text.contains("first"));
    }

    #[test]
    fn caller_header_overrides_default_connection_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", "keep-alive");
        let req = build_request("GET", "/x", headers, None);
        let text = String::from_utf8(req).unwrap();
        assert!(text.contains("Connection: keep-alive"));
        assert!(!text.contains("Connection: close"));
    }

    #[test]
    fn parse_response_splits_head_and_text_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":true}";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_text.as_deref(), Some("{\"ok\":true}"));
    }

    #[test]
    fn parse_response_handles_no_content() {
        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.body_text, None);
    }

    #[test]
    fn parse_response_binary_preserves_bytes_and_headers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"HTTP/1.1 200 OK\r\nX-Permissions: 644\r\n\r\n");
        raw.extend_from_slice(&[0u8, 1, 2, 255, 254]);
        let resp = parse_response_binary(&raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("x-permissions"), Some("644"));
        assert_eq!(resp.body.as_deref(), Some(&[0u8, 1, 2, 255, 254][..]));
    }
}
