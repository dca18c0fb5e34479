//! RFC 6455 frame-level read/write.
//!
//! This module only knows about single frames; `client.rs` layers
//! de-fragmentation and control-frame handling on top.

use crate::error::WsError;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Result<Self, WsError> {
        match v {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

pub struct RawFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Read one frame from the server. Servers must not mask; a set mask bit
/// or reserved bit or unknown/reserved opcode is a protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<RawFrame, WsError> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    let reserved = header[0] & 0x70;
    if reserved != 0 {
        return Err(WsError::ReservedBitSet);
    }
    let opcode = Opcode::from_u8(header[0] & 0x0F)?;

    let masked = header[1] & 0x80 != 0;
    if masked {
        return Err(WsError::ServerMasked);
    }

    let len7 = header[1] & 0x7F;
    let len = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            r.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            r.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok(RawFrame {
        fin,
        opcode,
        payload,
    })
}

/// Write one frame to the server. Clients always mask, always send a
/// single frame with the caller-supplied `fin`/`opcode`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
) -> Result<(), WsError> {
    if opcode.is_control() && payload.len() > 125 {
        return Err(WsError::ControlFrameTooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(payload.len() + 14);
    let first = (if fin { 0x80 } else { 0x00 }) | opcode.as_u8();
    out.push(first);

    let len = payload.len();
    if len <= 125 {
        out.push(0x80 | len as u8);
    } else if len <= 0xFFFF {
        out.push(0x80 | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    out.extend_from_slice(&key);

    let masked = mask(payload, &key);
    out.extend_from_slice(&masked);

    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

/// XOR `data` against `key`, cycled modulo 4 - used both to mask outgoing
/// payloads and, symmetrically, to unmask them back in tests.
pub fn mask(data: &[u8], key: &[u8; 4]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % 4])
        .collect()
}

/// Test-only helper shared with `client.rs`'s tests: encode a frame the
/// way a (spec-compliant, unmasked) server would, bypassing the client
/// masking in `write_frame` above.
#[cfg(test)]
pub(crate) fn encode_server_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let first = (if fin { 0x80 } else { 0x00 }) | opcode.as_u8();
    out.push(first);
    let len = payload.len();
    if len <= 125 {
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}
