//! RFC 6455 client handshake: nonce generation, the GET upgrade request,
//! and validation of the server's `101 Switching Protocols` response.

use crate::error::WsError;
use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn expected_accept(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub async fn dial(addr: &str) -> Result<TcpStream, WsError> {
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(WsError::DialTimeout),
    }
}

/// Run the client handshake over an already-connected stream, returning a
/// `BufReader` wrapping it so the caller can keep using it (with whatever
/// the server may have already pipelined still buffered) for frame I/O.
pub async fn handshake(
    mut stream: TcpStream,
    host_port: &str,
    path: &str,
) -> Result<BufReader<TcpStream>, WsError> {
    let nonce = generate_nonce();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host_port}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {nonce}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n",
        path = path,
        host_port = host_port,
        nonce = nonce,
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status_line = status_line.trim_end();
    if !status_line.starts_with("HTTP/1.1 101") {
        return Err(WsError::HandshakeRejected(status_line.to_string()));
    }

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if n == 0 || line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let upgrade = headers
        .get("upgrade")
        .ok_or_else(|| WsError::HandshakeMalformed("missing Upgrade header".to_string()))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(WsError::HandshakeMalformed(format!(
            "unexpected Upgrade header: {upgrade}"
        )));
    }

    let connection = headers
        .get("connection")
        .ok_or_else(|| WsError::HandshakeMalformed("missing Connection header".to_string()))?;
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(WsError::HandshakeMalformed(format!(
            "unexpected Connection header: {connection}"
        )));
    }

    let accept = headers.get("sec-websocket-accept").ok_or_else(|| {
        WsError::HandshakeMalformed("missing Sec-WebSocket-Accept header".to_string())
    })?;
    let expected = expected_accept(&nonce);
    if accept != &expected {
        return Err(WsError::HandshakeMalformed(format!(
            "Sec-WebSocket-Accept mismatch: got {accept}, expected {expected}"
        )));
    }

    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn accept_key_matches_rfc_example() {
        // The example key/accept pair from RFC 6455 section 1.3.
        let nonce = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(expected_accept(nonce), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    async fn run_server(
        listener: TcpListener,
        response: &'static str,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut total = 0;
            loop {
                let n = socket.read(&mut buf[total..]).await.unwrap();
                total += n;
                if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
        })
    }

    #[tokio::test]
    async fn rejects_non_101_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = run_server(listener, "HTTP/1.1 200 OK\r\n\r\n").await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let err = handshake(stream, &addr.to_string(), "/devtools/browser/x")
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::HandshakeRejected(_)));
    }

    #[tokio::test]
    async fn succeeds_on_matching_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut total = 0;
            let key_line = loop {
                let n = socket.read(&mut buf[total..]).await.unwrap();
                total += n;
                let text = String::from_utf8_lossy(&buf[..total]);
                if text.contains("\r\n\r\n") {
                    break text
                        .lines()
                        .find(|l| l.to_ascii_lowercase().starts_with("sec-websocket-key"))
                        .unwrap()
                        .split_once(':')
                        .unwrap()
                        .1
                        .trim()
                        .to_string();
                }
            };
            let accept = expected_accept(&key_line);
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\r\n"
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        handshake(stream, &addr.to_string(), "/devtools/browser/x")
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_mismatched_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: bm90dGhlcmlnaHR2YWx1ZQ==\r\n\r\n";
        let _server = run_server(listener, response).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let err = handshake(stream, &addr.to_string(), "/devtools/browser/x")
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::HandshakeMalformed(_)));
    }
}
