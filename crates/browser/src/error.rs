//! Error kinds for every subsystem, composed into one top-level enum.
//!
//! Each subsystem gets its own `thiserror` enum so a caller matching on
//! `CdpError::Transport(..)` doesn't have to know about WebSocket framing
//! details. `From` impls let `?` flow straight up to `CdpError`.

use thiserror::Error;

/// Errors raised while locating or launching the browser executable.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("no chrome-family executable found")]
    NotFound,

    #[error("failed to spawn browser process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for websocket debugger address")]
    AddressTimeout,

    #[error("failed to connect transport: {0}")]
    Connect(#[from] TransportError),
}

/// Errors raised by the hand-rolled WebSocket client (component B).
#[derive(Error, Debug)]
pub enum WsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dial timed out")]
    DialTimeout,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("handshake response malformed: {0}")]
    HandshakeMalformed(String),

    #[error("protocol error: reserved bit set")]
    ReservedBitSet,

    #[error("protocol error: invalid opcode {0}")]
    InvalidOpcode(u8),

    #[error("protocol error: server set the mask bit")]
    ServerMasked,

    #[error("control frame payload too large: {0} bytes")]
    ControlFrameTooLarge(usize),

    #[error("connection closed by peer: status {status}, reason {reason:?}")]
    Closed { status: u16, reason: String },
}

/// Errors raised by the transport layer (component C), above WS/pipe framing.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] WsError),

    #[error("transport closed")]
    Closed,

    #[error("message contained a NUL byte inside its body, which is invalid UTF-8 framing")]
    MalformedFrame,
}

/// Errors surfaced by the message multiplexer (component D).
#[derive(Error, Debug)]
pub enum MuxError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request method must not be empty")]
    EmptyMethod,

    #[error("cdp protocol error: code {code}, message {message}")]
    Protocol { code: i64, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("session was cancelled before the response arrived")]
    Cancelled,
}

/// Errors surfaced by session construction and lifecycle (component F).
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error("timed out waiting for an unattached page target")]
    TabDiscoveryTimeout,

    #[error("session was cancelled")]
    Cancelled,
}

/// Top-level error type every external collaborator matches on.
#[derive(Error, Debug)]
pub enum CdpError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    WebSocket(#[from] WsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type Result<T> = std::result::Result<T, CdpError>;
