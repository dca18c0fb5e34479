//! POSIX transport: a pair of anonymous pipes wired onto the child's fd 3
//! (input) and fd 4 (output), NUL-delimited framing in both directions.
//!
//! `prepare` must run before `Command::spawn`; it registers a `pre_exec`
//! hook that `dup2`s the pipe ends into 3/4 inside the forked child. Once
//! the child is spawned, `PreparedPipes::finish` drops this process's
//! copies of the fds handed to the child and wraps the remaining read end
//! for async I/O.

use super::{TransportReader, TransportWriter};
use crate::error::TransportError;
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio::sync::Mutex;

const NUL: u8 = 0x00;

fn to_io(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(to_io)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(to_io)?;
    Ok(())
}

fn set_cloexec(fd: &OwnedFd) -> std::io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(to_io)?;
    Ok(())
}

pub struct PreparedPipes {
    pub writer: PipeWriter,
    child_req_read: OwnedFd,
    child_resp_write: OwnedFd,
    resp_read: OwnedFd,
}

impl PreparedPipes {
    /// Call once `command.spawn()` has returned (successfully or not) to
    /// release this process's copies of the fds handed to the child and
    /// finish building the reader half.
    pub fn finish(self) -> Result<PipeReader, TransportError> {
        drop(self.child_req_read);
        drop(self.child_resp_write);
        set_nonblocking(&self.resp_read).map_err(TransportError::Io)?;
        Ok(PipeReader {
            fd: AsyncFd::new(self.resp_read).map_err(TransportError::Io)?,
            buf: Vec::new(),
        })
    }
}

/// Create the pipe pair and register the fd-3/fd-4 wiring on `command`.
/// Must be called before `command.spawn()`.
pub fn prepare(command: &mut Command) -> Result<PreparedPipes, TransportError> {
    let (req_read, req_write) = pipe().map_err(to_io)?;
    let (resp_read, resp_write) = pipe().map_err(to_io)?;

    // The parent doesn't want the child inheriting its own ends of the
    // pipes it keeps (only the dup2'd 3/4 should survive exec).
    set_cloexec(&req_write).map_err(TransportError::Io)?;
    set_cloexec(&resp_read).map_err(TransportError::Io)?;

    let child_req_read_raw = req_read.as_raw_fd();
    let child_resp_write_raw = resp_write.as_raw_fd();

    // Safety: only async-signal-safe calls (dup2) between fork and exec.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(child_req_read_raw, 3) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(child_resp_write_raw, 4) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    set_nonblocking(&req_write).map_err(TransportError::Io)?;

    let writer = PipeWriter {
        fd: Arc::new(AsyncFd::new(req_write).map_err(TransportError::Io)?),
        write_lock: Arc::new(Mutex::new(())),
    };

    Ok(PreparedPipes {
        writer,
        child_req_read: req_read,
        child_resp_write: resp_write,
        resp_read,
    })
}

#[derive(Clone)]
pub struct PipeWriter {
    fd: Arc<AsyncFd<OwnedFd>>,
    write_lock: Arc<Mutex<()>>,
}

pub struct PipeReader {
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

#[async_trait]
impl TransportWriter for PipeWriter {
    async fn write_message(&self, mut bytes: Vec<u8>) -> Result<(), TransportError> {
        bytes.push(NUL);
        let _guard = self.write_lock.lock().await;
        let mut offset = 0;
        while offset < bytes.len() {
            let mut ready = self.fd.writable().await.map_err(TransportError::Io)?;
            let slice = &bytes[offset..];
            match ready.try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(raw, slice.as_ptr() as *const _, slice.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the last `Arc<AsyncFd<OwnedFd>>` closes the fd; nothing
        // else to flush since every write already fully drains `bytes`.
        Ok(())
    }
}

#[async_trait]
impl TransportReader for PipeReader {
    async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == NUL) {
                let mut message = self.buf.split_off(pos + 1);
                std::mem::swap(&mut message, &mut self.buf);
                message.pop(); // drop the NUL terminator
                return Ok(message);
            }

            let mut ready = self.fd.readable().await.map_err(TransportError::Io)?;
            let mut chunk = [0u8; 4096];
            match ready.try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::read(raw, chunk.as_mut_ptr() as *mut _, chunk.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    if self.buf.is_empty() {
                        return Err(TransportError::Closed);
                    }
                    return Ok(std::mem::take(&mut self.buf));
                }
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::write as nix_write;

    fn make_pair() -> (PipeWriter, PipeReader) {
        let (read, write) = pipe().unwrap();
        set_nonblocking(&write).unwrap();
        set_nonblocking(&read).unwrap();
        let writer = PipeWriter {
            fd: Arc::new(AsyncFd::new(write).unwrap()),
            write_lock: Arc::new(Mutex::new(())),
        };
        let reader = PipeReader {
            fd: AsyncFd::new(read).unwrap(),
            buf: Vec::new(),
        };
        (writer, reader)
    }

    #[tokio::test]
    async fn writes_nul_delimited_message() {
        let (writer, mut reader) = make_pair();
        writer.write_message(b"hello".to_vec()).await.unwrap();
        let message = reader.read_message().await.unwrap();
        assert_eq!(message, b"hello");
    }

    #[tokio::test]
    async fn multiple_messages_in_one_chunk() {
        let (writer, mut reader) = make_pair();
        writer.write_message(b"one".to_vec()).await.unwrap();
        writer.write_message(b"two".to_vec()).await.unwrap();
        assert_eq!(reader.read_message().await.unwrap(), b"one");
        assert_eq!(reader.read_message().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn tolerates_missing_trailing_nul_at_eof() {
        let (read, write) = pipe().unwrap();
        set_nonblocking(&read).unwrap();
        nix_write(&write, b"partial").unwrap();
        drop(write); // EOF with no trailing NUL
        let mut reader = PipeReader {
            fd: AsyncFd::new(read).unwrap(),
            buf: Vec::new(),
        };
        let message = reader.read_message().await.unwrap();
        assert_eq!(message, b"partial");
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
