//! A client library that drives a Chromium-family browser over the Chrome
//! DevTools Protocol: launches the browser as a child process, speaks CDP
//! over a pipe (POSIX) or hand-rolled WebSocket (Windows) transport, and
//! multiplexes requests/events across concurrent callers and tabs.
//!
//! The ~100 generated per-method CDP domain wrappers, the default browser
//! flag list, and the test harness are deliberately out of scope here -
//! external collaborators drive everything through [`Session::send`],
//! [`Session::send_and_wait`] and [`Session::subscribe`].

pub mod cell;
pub mod codec;
pub mod error;
pub mod log;
pub mod multiplexer;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod ws;

pub use codec::{CdpSessionId, ErrorObject, Message, MessageKind, RequestId, TargetId};
pub use error::{CdpError, MuxError, Result, SessionError, SupervisorError, TransportError, WsError};
pub use multiplexer::{EventStream, Multiplexer};
pub use session::{FlagValue, Session, SessionOptions, SessionState};
