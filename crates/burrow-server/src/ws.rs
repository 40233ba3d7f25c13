//! WebSocket server handshake over an already-read request head
//!
//! The public port multiplexes agent upgrades with proxied traffic, so the
//! request head has been consumed by the time the socket is identified as
//! an agent connection. The 101 response is written by hand and the
//! socket is handed to tungstenite in server role.

use crate::request::RequestHead;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

/// Handshake errors
#[derive(Debug, Error)]
pub enum WsAcceptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a WebSocket upgrade request")]
    NotWebSocket,

    #[error("Unsupported WebSocket version")]
    UnsupportedVersion,
}

/// Complete the server side of a WebSocket handshake for a request whose
/// head was already parsed, then wrap the socket.
pub async fn accept_websocket(
    mut stream: TcpStream,
    head: &RequestHead,
) -> Result<WebSocketStream<TcpStream>, WsAcceptError> {
    let is_websocket = head
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let key = match head.websocket_key() {
        Some(key) if is_websocket && head.method == "GET" => key,
        _ => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            return Err(WsAcceptError::NotWebSocket);
        }
    };

    if head.header("sec-websocket-version") != Some("13") {
        let _ = stream
            .write_all(b"HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 13\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;
        return Err(WsAcceptError::UnsupportedVersion);
    }

    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept
    );
    stream.write_all(response.as_bytes()).await?;

    Ok(WebSocketStream::from_raw_socket(stream, Role::Server, None).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap()
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = async { listener.accept().await.map(|(s, _)| s) };
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_writes_switching_protocols() {
        use tokio::io::AsyncReadExt;

        let (mut client, server) = connected_pair().await;
        let head = head(
            "GET /ws HTTP/1.1\r\nHost: tunnel.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        );

        let accept_task = tokio::spawn(async move { accept_websocket(server, &head).await });

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).to_string();

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        // RFC 6455 sample nonce has a well-known accept value
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(accept_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_non_websocket_upgrade_rejected() {
        let (_client, server) = connected_pair().await;
        let head = head("GET / HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n");

        let result = accept_websocket(server, &head).await;
        assert!(matches!(result, Err(WsAcceptError::NotWebSocket)));
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let (_client, server) = connected_pair().await;
        let head = head(
            "GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Key: abc\r\n\r\n",
        );

        let result = accept_websocket(server, &head).await;
        assert!(matches!(result, Err(WsAcceptError::UnsupportedVersion)));
    }
}
