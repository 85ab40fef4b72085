//! The WebSocket opening handshake.
//!
//! The processor parses the HTTP Upgrade request straight out of the
//! connection's read accumulator. A buffer that does not yet hold the
//! full header block is reported as [`HandshakeOutcome::Incomplete`];
//! any bytes after the header block (an eager client may pipeline its
//! first frames) are left in place for the frame decoder.
//!
//! Rejections close the connection without a response body: a peer that
//! fails the handshake gets no explanation beyond the close.

use std::collections::HashMap;

use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{ProtoError, ProtoResult};

/// The WebSocket magic GUID used in the handshake.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers every upgrade request must carry.
const REQUIRED_HEADERS: [&str; 6] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "origin",
    "sec-websocket-version",
];

/// A successfully parsed and accepted upgrade request.
#[derive(Debug)]
pub struct Upgrade {
    /// Request path, e.g. `/chat`.
    pub path: String,
    /// Query string, without the leading `?`.
    pub query: Option<String>,
    /// Request headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// The `101 Switching Protocols` response to write back.
    pub response: Bytes,
}

/// Outcome of a handshake processing attempt.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The buffer does not yet hold the full header block.
    Incomplete,
    /// The request was accepted; leftover bytes remain in the buffer.
    Upgraded(Upgrade),
}

/// Parses and validates WebSocket upgrade requests.
#[derive(Debug, Clone)]
pub struct HandshakeProcessor {
    allowed_hosts: Vec<String>,
    allowed_origins: Vec<String>,
}

impl HandshakeProcessor {
    /// Create a processor with the server's Host and Origin allow-lists.
    pub fn new(allowed_hosts: Vec<String>, allowed_origins: Vec<String>) -> Self {
        Self {
            allowed_hosts,
            allowed_origins,
        }
    }

    /// Try to parse one upgrade request from the front of `buf`.
    ///
    /// On success the header block is consumed, pipelined bytes stay in
    /// the buffer, and the returned [`Upgrade`] carries the response to
    /// send. Validation failures are [`ProtoError::HandshakeRejected`].
    pub fn process(&self, buf: &mut BytesMut) -> ProtoResult<HandshakeOutcome> {
        let Some(header_end) = find_header_end(buf) else {
            debug!("handshake data incomplete, postponing");
            return Ok(HandshakeOutcome::Incomplete);
        };

        let block = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let mut lines = block.lines();

        let request_line = lines
            .next()
            .ok_or_else(|| ProtoError::rejected("empty request"))?;
        let (path, query) = self.parse_request_line(request_line)?;

        let mut headers = HashMap::new();
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtoError::rejected(format!("malformed header line: {line:?}")))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        self.validate_headers(&headers)?;

        let key = &headers["sec-websocket-key"];
        let accept = compute_accept_key(key);
        let response = Bytes::from(format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        ));

        buf.advance(header_end);

        Ok(HandshakeOutcome::Upgraded(Upgrade {
            path,
            query,
            headers,
            response,
        }))
    }

    /// Parse `GET <relative-uri> HTTP/<version>`.
    fn parse_request_line(&self, line: &str) -> ProtoResult<(String, Option<String>)> {
        let mut parts = line.split_whitespace();
        let (Some(method), Some(uri), Some(proto)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtoError::rejected(format!(
                "request line missing, found {line:?}"
            )));
        };

        if method != "GET" {
            return Err(ProtoError::rejected(format!(
                "request method must be GET, found {method:?}"
            )));
        }

        let version = proto
            .strip_prefix("HTTP/")
            .ok_or_else(|| ProtoError::rejected(format!("not an HTTP request line: {line:?}")))?;
        if !http_version_at_least_1_1(version) {
            return Err(ProtoError::rejected(format!(
                "http version must be >= 1.1, found {version}"
            )));
        }

        if uri.contains("://") || !uri.starts_with('/') {
            return Err(ProtoError::rejected(format!(
                "request URI must be relative, found {uri}"
            )));
        }

        match uri.split_once('?') {
            Some((path, query)) => Ok((path.to_string(), Some(query.to_string()))),
            None => Ok((uri.to_string(), None)),
        }
    }

    fn validate_headers(&self, headers: &HashMap<String, String>) -> ProtoResult<()> {
        let missing: Vec<&str> = REQUIRED_HEADERS
            .iter()
            .copied()
            .filter(|h| !headers.contains_key(*h))
            .collect();
        if !missing.is_empty() {
            return Err(ProtoError::rejected(format!(
                "missing headers: {}",
                missing.join(", ")
            )));
        }

        let host = &headers["host"];
        if !self.allowed_hosts.iter().any(|h| h == host) {
            return Err(ProtoError::rejected(format!("Host {host} is not allowed")));
        }

        if !headers["upgrade"].to_ascii_lowercase().contains("websocket") {
            return Err(ProtoError::rejected(
                "Upgrade header does not contain the keyword websocket",
            ));
        }

        if !headers["connection"].to_ascii_lowercase().contains("upgrade") {
            return Err(ProtoError::rejected(
                "Connection header does not contain the token Upgrade",
            ));
        }

        let origin = &headers["origin"];
        if !self.allowed_origins.iter().any(|o| o == origin) {
            return Err(ProtoError::rejected(format!(
                "Origin {origin} is not allowed"
            )));
        }

        if headers["sec-websocket-version"] != "13" {
            return Err(ProtoError::rejected(format!(
                "WebSocket version 13 supported, {} found",
                headers["sec-websocket-version"]
            )));
        }

        Ok(())
    }
}

/// Locate the end of the header block (offset one past the blank line).
///
/// Accepts both CRLF and bare-LF line endings.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
        .or_else(|| {
            buf.windows(2)
                .position(|w| w == b"\n\n")
                .map(|idx| idx + 2)
        })
}

/// Compute the `Sec-WebSocket-Accept` value from the client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn http_version_at_least_1_1(version: &str) -> bool {
    let mut parts = version.splitn(2, '.');
    let major: u32 = match parts.next().and_then(|p| p.parse().ok()) {
        Some(v) => v,
        None => return false,
    };
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    major > 1 || (major == 1 && minor >= 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> HandshakeProcessor {
        HandshakeProcessor::new(
            vec!["server.example.com".to_string()],
            vec!["http://example.com".to_string()],
        )
    }

    fn sample_request() -> &'static str {
        "GET /chat HTTP/1.1\r\n\
         Host: server.example.com\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Origin: http://example.com\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    }

    fn upgrade(buf: &mut BytesMut) -> Upgrade {
        match processor().process(buf).unwrap() {
            HandshakeOutcome::Upgraded(up) => up,
            HandshakeOutcome::Incomplete => panic!("expected an upgrade"),
        }
    }

    #[test]
    fn test_accepts_rfc6455_sample() {
        let mut buf = BytesMut::from(sample_request());
        let up = upgrade(&mut buf);

        assert_eq!(up.path, "/chat");
        assert_eq!(up.query, None);
        let response = String::from_utf8_lossy(&up.response).into_owned();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
        // the canonical accept value from RFC 6455 §1.3
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_compute_accept_key_rfc_sample() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_incomplete_without_blank_line() {
        let mut buf = BytesMut::from("GET / HTTP/1.1\r\nHost: server.example.com\r\n");
        assert!(matches!(
            processor().process(&mut buf).unwrap(),
            HandshakeOutcome::Incomplete
        ));
        // nothing consumed
        assert!(buf.starts_with(b"GET"));
    }

    #[test]
    fn test_leftover_bytes_preserved() {
        let mut buf = BytesMut::from(sample_request());
        buf.extend_from_slice(&[0x81, 0x01, b'x']); // a pipelined frame
        let _up = upgrade(&mut buf);
        assert_eq!(&buf[..], &[0x81, 0x01, b'x']);
    }

    #[test]
    fn test_query_string_split() {
        let request = sample_request().replacen("/chat", "/chat?room=42&mode=x", 1);
        let mut buf = BytesMut::from(request.as_str());
        let up = upgrade(&mut buf);
        assert_eq!(up.path, "/chat");
        assert_eq!(up.query.as_deref(), Some("room=42&mode=x"));
    }

    #[test]
    fn test_rejects_disallowed_origin() {
        let request = sample_request().replacen("http://example.com", "http://evil.example", 1);
        let mut buf = BytesMut::from(request.as_str());
        let err = processor().process(&mut buf).unwrap_err();
        assert!(err.to_string().contains("Origin"));
    }

    #[test]
    fn test_rejects_disallowed_host() {
        let request = sample_request().replacen("server.example.com", "other.example.com", 1);
        let mut buf = BytesMut::from(request.as_str());
        let err = processor().process(&mut buf).unwrap_err();
        assert!(err.to_string().contains("Host"));
    }

    #[test]
    fn test_rejects_missing_headers() {
        let request = sample_request().replacen("Origin: http://example.com\r\n", "", 1);
        let mut buf = BytesMut::from(request.as_str());
        let err = processor().process(&mut buf).unwrap_err();
        assert!(err.to_string().contains("missing headers"));
        assert!(err.to_string().contains("origin"));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let request = sample_request().replacen("Version: 13", "Version: 8", 1);
        let mut buf = BytesMut::from(request.as_str());
        let err = processor().process(&mut buf).unwrap_err();
        assert!(err.to_string().contains("13"));
    }

    #[test]
    fn test_rejects_absolute_uri() {
        let request = sample_request().replacen("/chat", "http://server.example.com/chat", 1);
        let mut buf = BytesMut::from(request.as_str());
        let err = processor().process(&mut buf).unwrap_err();
        assert!(err.to_string().contains("relative"));
    }

    #[test]
    fn test_rejects_post() {
        let request = sample_request().replacen("GET", "POST", 1);
        let mut buf = BytesMut::from(request.as_str());
        let err = processor().process(&mut buf).unwrap_err();
        assert!(err.to_string().contains("GET"));
    }

    #[test]
    fn test_rejects_http_1_0() {
        let request = sample_request().replacen("HTTP/1.1", "HTTP/1.0", 1);
        let mut buf = BytesMut::from(request.as_str());
        assert!(processor().process(&mut buf).is_err());
    }

    #[test]
    fn test_accepts_http_2() {
        let request = sample_request().replacen("HTTP/1.1", "HTTP/2", 1);
        let mut buf = BytesMut::from(request.as_str());
        let up = upgrade(&mut buf);
        assert_eq!(up.path, "/chat");
    }

    #[test]
    fn test_accepts_bare_lf_line_endings() {
        let request = sample_request().replace("\r\n", "\n");
        let mut buf = BytesMut::from(request.as_str());
        let up = upgrade(&mut buf);
        assert_eq!(up.path, "/chat");
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = sample_request().replacen("Host:", "hOsT:", 1);
        let mut buf = BytesMut::from(request.as_str());
        let up = upgrade(&mut buf);
        assert_eq!(up.headers["host"], "server.example.com");
    }
}
