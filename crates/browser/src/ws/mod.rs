//! Minimal RFC 6455 client: handshake, frame I/O, de-fragmentation and
//! control-frame handling. No TLS, no compression, no extensions - this is
//! the Windows transport's wire layer, not a general-purpose WS client.

pub mod client;
pub mod frame;
pub mod handshake;

pub use client::{connect, WsReader, WsWriter};
pub use frame::Opcode;
