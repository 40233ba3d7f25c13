//! Public request head parsing and body buffering

use burrow_proto::Headers;
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum request head size (request line + headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum buffered request body.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Request parsing errors
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before a full request head arrived")]
    UnexpectedEof,

    #[error("Request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("Request body exceeds {MAX_BODY_SIZE} bytes")]
    BodyTooLarge,

    #[error("Malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Malformed chunked body")]
    MalformedChunk,
}

/// Parsed request head.
///
/// Header names keep their original casing; lookups are case-insensitive.
/// Duplicate headers are combined with `", "` the way intermediaries
/// conventionally fold them.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
    /// Bytes consumed by the head, including the blank-line terminator.
    pub head_len: usize,
}

impl RequestHead {
    /// Parse a complete head (everything up to and including `CRLF CRLF`).
    pub fn parse(head: &[u8]) -> Result<Self, RequestError> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| RequestError::MalformedRequestLine(request_line.to_string()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| RequestError::MalformedRequestLine(request_line.to_string()))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line
                .find(':')
                .ok_or_else(|| RequestError::MalformedHeader(line.to_string()))?;
            let name = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            if name.is_empty() {
                return Err(RequestError::MalformedHeader(line.to_string()));
            }

            let existing = headers
                .keys()
                .find(|k| k.eq_ignore_ascii_case(&name))
                .cloned();
            match existing {
                Some(key) => {
                    if let Some(entry) = headers.get_mut(&key) {
                        entry.push_str(", ");
                        entry.push_str(&value);
                    }
                }
                None => {
                    headers.insert(name, value);
                }
            }
        }

        Ok(Self {
            method,
            target,
            version,
            headers,
            head_len: head.len(),
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// First DNS label of the Host header, with any port stripped.
    pub fn host_label(&self) -> Option<&str> {
        let host = self.host()?;
        let host = host.split(':').next().unwrap_or(host);
        let label = host.split('.').next().unwrap_or(host);
        if label.is_empty() {
            None
        } else {
            Some(label)
        }
    }

    /// Replace the Host header value, keeping the original key casing.
    pub fn set_host(&mut self, value: String) {
        let key = self
            .headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case("host"))
            .cloned();
        match key {
            Some(key) => {
                self.headers.insert(key, value);
            }
            None => {
                self.headers.insert("Host".to_string(), value);
            }
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether this request asks for a protocol upgrade (WebSocket or any
    /// CONNECT-like pattern using the Upgrade mechanism).
    pub fn wants_upgrade(&self) -> bool {
        let connection_upgrade = self
            .header("connection")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        connection_upgrade && self.header("upgrade").is_some()
    }

    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
    }
}

/// Read from `stream` until a complete head sits in `buf`. Returns the
/// head length (terminator included); bytes beyond it stay in `buf` as the
/// start of the body.
pub async fn read_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<usize, RequestError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_head_end(buf) {
            return Ok(pos);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(RequestError::HeadTooLarge);
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(RequestError::UnexpectedEof);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Buffer the full request body, honoring `Content-Length` or chunked
/// transfer encoding. `buf` holds whatever arrived beyond the head.
pub async fn read_body<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    head: &RequestHead,
) -> Result<Vec<u8>, RequestError>
where
    S: AsyncRead + Unpin,
{
    if head.is_chunked() {
        return read_chunked_body(stream, buf).await;
    }

    let length = match head.content_length() {
        Some(n) => n,
        None => return Ok(Vec::new()),
    };
    if length > MAX_BODY_SIZE {
        return Err(RequestError::BodyTooLarge);
    }

    while buf.len() < length {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(RequestError::UnexpectedEof);
        }
    }

    let body = buf.split_to(length);
    Ok(body.to_vec())
}

async fn read_chunked_body<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Vec<u8>, RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();

    loop {
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(RequestError::UnexpectedEof);
            }
        };

        let size_line = String::from_utf8_lossy(&buf[..line_end]).to_string();
        buf.advance(line_end + 2);

        // Chunk extensions after ';' are ignored
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size =
            usize::from_str_radix(size_str, 16).map_err(|_| RequestError::MalformedChunk)?;

        if size == 0 {
            // Consume the trailer section up to its terminating CRLF
            loop {
                if buf.len() >= 2 && &buf[..2] == b"\r\n" {
                    buf.advance(2);
                    return Ok(body);
                }
                if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                    buf.advance(pos + 2);
                    continue;
                }
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(RequestError::UnexpectedEof);
                }
            }
        }

        if body.len() + size > MAX_BODY_SIZE {
            return Err(RequestError::BodyTooLarge);
        }

        while buf.len() < size + 2 {
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(RequestError::UnexpectedEof);
            }
        }
        body.extend_from_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return Err(RequestError::MalformedChunk);
        }
        buf.advance(size + 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_simple_get() {
        let head = parse("GET /x?q=1 HTTP/1.1\r\nHost: foo.tunnel.example.com\r\n\r\n");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/x?q=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.host(), Some("foo.tunnel.example.com"));
    }

    #[test]
    fn test_host_label_extraction() {
        let head = parse("GET / HTTP/1.1\r\nHost: foo.tunnel.example.com:8080\r\n\r\n");
        assert_eq!(head.host_label(), Some("foo"));

        let bare = parse("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(bare.host_label(), Some("localhost"));
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let head = parse("GET / HTTP/1.1\r\nhost: a\r\nX-Thing: b\r\n\r\n");
        assert_eq!(head.header("Host"), Some("a"));
        assert_eq!(head.header("x-thing"), Some("b"));
        assert_eq!(head.header("missing"), None);
    }

    #[test]
    fn test_duplicate_headers_folded() {
        let head = parse("GET / HTTP/1.1\r\nAccept: a\r\naccept: b\r\n\r\n");
        assert_eq!(head.header("accept"), Some("a, b"));
    }

    #[test]
    fn test_set_host_keeps_key_casing() {
        let mut head = parse("GET / HTTP/1.1\r\nhost: foo.example.com\r\n\r\n");
        head.set_host("127.0.0.1:3000".to_string());
        assert_eq!(head.headers.get("host").map(String::as_str), Some("127.0.0.1:3000"));
    }

    #[test]
    fn test_wants_upgrade() {
        let ws = parse(
            "GET /socket HTTP/1.1\r\nHost: a\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert!(ws.wants_upgrade());

        let plain = parse("GET / HTTP/1.1\r\nHost: a\r\nConnection: keep-alive\r\n\r\n");
        assert!(!plain.wants_upgrade());
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(RequestHead::parse(b"GARBAGE\r\n\r\n").is_err());
    }

    #[test]
    fn test_malformed_header_line() {
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_read_head_across_partial_reads() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nBODY";
        let (mut client, mut server) = tokio::io::duplex(16);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in raw.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let mut buf = BytesMut::new();
        let head_len = read_head(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf[..head_len], b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        // Body bytes stay buffered after the head
        assert_eq!(&buf[head_len..], b"BODY");
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);

        let mut buf = BytesMut::new();
        let result = read_head(&mut server, &mut buf).await;
        assert!(matches!(result, Err(RequestError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_read_body_content_length() {
        let head = parse("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\n\r\n");
        let (mut client, mut server) = tokio::io::duplex(16);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"hello world").await.unwrap();
        });

        let mut buf = BytesMut::new();
        let body = read_body(&mut server, &mut buf, &head).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_read_body_uses_leftover_bytes() {
        let head = parse("POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n");
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);

        // Body fully buffered during head read; no further stream reads needed
        let mut buf = BytesMut::from(&b"hello"[..]);
        let body = read_body(&mut server, &mut buf, &head).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_read_body_no_length() {
        let head = parse("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let (client, mut server) = tokio::io::duplex(16);
        drop(client);

        let mut buf = BytesMut::new();
        let body = read_body(&mut server, &mut buf, &head).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_read_chunked_body() {
        let head = parse("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n");
        let (mut client, mut server) = tokio::io::duplex(16);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client
                .write_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
                .await
                .unwrap();
        });

        let mut buf = BytesMut::new();
        let body = read_body(&mut server, &mut buf, &head).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_read_chunked_body_with_extension() {
        let head = parse("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n");
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let mut buf = BytesMut::from(&b"4;ext=1\r\nwxyz\r\n0\r\n\r\n"[..]);
        let body = read_body(&mut server, &mut buf, &head).await.unwrap();
        assert_eq!(body, b"wxyz");
    }

    #[tokio::test]
    async fn test_read_chunked_body_malformed_size() {
        let head = parse("POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n");
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let mut buf = BytesMut::from(&b"zz\r\n\r\n"[..]);
        let result = read_body(&mut server, &mut buf, &head).await;
        assert!(matches!(result, Err(RequestError::MalformedChunk)));
    }
}
