//! Streaming parser for upstream HTTP responses
//!
//! Agents relay the upstream response as raw bytes in `data` frames. The
//! parser buffers until the head is complete, then hands every remaining
//! byte through untouched. Two states only: headers, then body.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Maximum buffered response head.
pub const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Response parsing errors
#[derive(Debug, Error)]
pub enum ResponseParseError {
    #[error("Malformed status line: {0}")]
    MalformedStatusLine(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Response head exceeds {MAX_RESPONSE_HEAD} bytes")]
    HeadTooLarge,
}

/// Parsed upstream response head.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

/// Event produced as upstream bytes arrive.
#[derive(Debug, PartialEq)]
pub enum ResponseEvent {
    Head(UpstreamHead),
    Body(Bytes),
}

enum State {
    Headers(BytesMut),
    Body,
}

/// Incremental response parser. Partial frames buffer cleanly; a head
/// split across any number of `data` frames parses once the terminator
/// arrives.
pub struct ResponseParser {
    state: State,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::Headers(BytesMut::new()),
        }
    }

    /// Feed one chunk of upstream bytes, yielding zero or more events.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ResponseEvent>, ResponseParseError> {
        match &mut self.state {
            State::Body => {
                if chunk.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![ResponseEvent::Body(Bytes::copy_from_slice(chunk))])
                }
            }
            State::Headers(buf) => {
                buf.extend_from_slice(chunk);

                let head_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    Some(pos) => pos + 4,
                    None => {
                        if buf.len() > MAX_RESPONSE_HEAD {
                            return Err(ResponseParseError::HeadTooLarge);
                        }
                        return Ok(Vec::new());
                    }
                };

                let head = parse_head(&buf[..head_end])?;
                let remainder = Bytes::copy_from_slice(&buf[head_end..]);
                self.state = State::Body;

                let mut events = vec![ResponseEvent::Head(head)];
                if !remainder.is_empty() {
                    events.push(ResponseEvent::Body(remainder));
                }
                Ok(events)
            }
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_head(raw: &[u8]) -> Result<UpstreamHead, ResponseParseError> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or("");
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts
        .next()
        .filter(|v| v.starts_with("HTTP/"))
        .ok_or_else(|| ResponseParseError::MalformedStatusLine(status_line.to_string()))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ResponseParseError::MalformedStatusLine(status_line.to_string()))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let colon = line
            .find(':')
            .ok_or_else(|| ResponseParseError::MalformedHeader(line.to_string()))?;
        headers.push((
            line[..colon].trim().to_string(),
            line[colon + 1..].trim().to_string(),
        ));
    }

    Ok(UpstreamHead {
        status,
        reason,
        headers,
    })
}

/// Hop-by-hop headers the relay strips before re-emitting a response; the
/// relay sets its own connection semantics on the public socket.
pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
}

/// Serialize a response head for the public socket. Hop-by-hop headers are
/// dropped; the relay closes the socket to delimit the body, so it always
/// announces `Connection: close`.
pub fn encode_head(head: &UpstreamHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", head.status, head.reason).as_bytes());
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out
}
