//! Windows transport: the hand-rolled WebSocket client in `crate::ws`,
//! wrapped so it satisfies `TransportReader`/`TransportWriter`. Each
//! message is already one complete WS text frame (or de-fragmented
//! message) - no extra framing needed on top, unlike the pipe transport's
//! NUL delimiting.
//!
//! Finding the debugger address by scraping the child's stderr is the
//! supervisor's job (component E); this module only dials an address
//! once it's known.

use super::{TransportReader, TransportWriter};
use crate::error::{TransportError, WsError};
use crate::ws::{self, WsReader, WsWriter};
use async_trait::async_trait;
use url::Url;

pub struct WebSocketTransportReader {
    inner: WsReader,
}

#[derive(Clone)]
pub struct WebSocketTransportWriter {
    inner: WsWriter,
}

/// Dial a `ws://host:port/devtools/browser/<uuid>` address, as scraped
/// from the child's stderr.
pub async fn connect(address: &str) -> Result<(WebSocketTransportReader, WebSocketTransportWriter), TransportError> {
    let url = Url::parse(address)
        .map_err(|e| TransportError::WebSocket(WsError::HandshakeMalformed(e.to_string())))?;
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::WebSocket(WsError::HandshakeMalformed("missing host".into())))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let host_port = format!("{host}:{port}");
    let path = if url.query().is_some() {
        format!("{}?{}", url.path(), url.query().unwrap())
    } else {
        url.path().to_string()
    };

    let (reader, writer) = ws::connect(&host_port, &path).await?;
    Ok((
        WebSocketTransportReader { inner: reader },
        WebSocketTransportWriter { inner: writer },
    ))
}

#[async_trait]
impl TransportReader for WebSocketTransportReader {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(self.inner.read_message().await?)
    }
}

#[async_trait]
impl TransportWriter for WebSocketTransportWriter {
    async fn write_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let text = String::from_utf8(bytes).map_err(|_| TransportError::MalformedFrame)?;
        Ok(self.inner.write_text(&text).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(self.inner.close(1000, "session closed").await?)
    }
}
