//! Two interchangeable back-ends behind "read one message / write one
//! message": anonymous POSIX pipes, or a hand-rolled WebSocket client on
//! Windows. Both speak complete JSON messages - framing differences (NUL
//! delimiter vs. WS text frame) are fully hidden from the multiplexer.

use crate::error::TransportError;
use async_trait::async_trait;

#[cfg(unix)]
pub mod pipe;
#[cfg(windows)]
pub mod websocket;

/// Read half of a transport. Owned exclusively by the reader task.
#[async_trait]
pub trait TransportReader: Send {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Write half of a transport. Owned exclusively by the writer task, but
/// cheaply cloneable so teardown code can also reach it to send a final
/// message (e.g. `Browser.close`) or close the connection.
#[async_trait]
pub trait TransportWriter: Send + Sync {
    async fn write_message(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(unix)]
pub use pipe::{prepare as prepare_pipe, PipeReader, PipeWriter, PreparedPipes};
#[cfg(windows)]
pub use websocket::{connect as connect_websocket, WebSocketTransportReader, WebSocketTransportWriter};

/// Lets the supervisor hand session/multiplexer code a type-erased
/// transport so the unix/windows split doesn't leak past this module.
#[async_trait]
impl TransportReader for Box<dyn TransportReader + Send> {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        (**self).read_message().await
    }
}

#[async_trait]
impl TransportWriter for Box<dyn TransportWriter + Send + Sync> {
    async fn write_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        (**self).write_message(bytes).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        (**self).close().await
    }
}
