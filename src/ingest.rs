use std::ffi::CString;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::endpoint::{self, Endpoint};
use crate::sys::FileDesc;

/// Line-buffered reader over the ingest named pipe. Treats the pipe as an
/// endless stream of ASCII; a read may land mid-line, so partial lines are
/// held in `carry` across calls rather than discarded.
pub struct Pipe {
    path: String,
    fd: FileDesc,
    carry: Vec<u8>,
    buf: [u8; 4096],
}

impl Pipe {
    /// Opens `path` for non-blocking reading, creating it as a FIFO first if
    /// it doesn't exist.
    pub fn open(path: &str) -> io::Result<Pipe> {
        ensure_fifo(path)?;
        let fd = open_nonblocking(path)?;
        Ok(Pipe {
            path: path.to_string(),
            fd,
            carry: Vec::new(),
            buf: [0u8; 4096],
        })
    }

    /// Drains whatever is currently available, returning the valid records
    /// found. Invalid lines are silently dropped. A zero-byte read with no
    /// error means the pipe hung up (all writers closed); the caller should
    /// then call `reopen`.
    ///
    /// Returns `Ok(None)` on a transient empty read (`WouldBlock`), which is
    /// normal and not a hangup.
    pub fn drain(&mut self) -> io::Result<Option<Vec<Endpoint>>> {
        match self.fd.read(&mut self.buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.carry.extend_from_slice(&self.buf[..n]);
                Ok(Some(self.take_complete_lines()))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Some(Vec::new())),
            Err(e) => Err(e),
        }
    }

    fn take_complete_lines(&mut self) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        loop {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if let Ok(text) = std::str::from_utf8(line) {
                if let Some(endpoint) = endpoint::parse_record(text) {
                    endpoints.push(endpoint);
                }
            }
        }
        endpoints
    }

    /// Reopens the pipe after a hangup, preserving the registration's handle
    /// number. The old fd is dropped (closed) and the new one is `dup2`'d
    /// onto the same number so the caller never has to touch the epoll
    /// registration.
    pub fn reopen(&mut self) -> io::Result<()> {
        let old_fd = self.fd.as_raw_fd();
        let fresh = open_nonblocking(&self.path)?;

        let rc = unsafe { libc::dup2(fresh.as_raw_fd(), old_fd) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        // `fresh` is now a duplicate of `old_fd`; drop it, keeping `self.fd`
        // (still wrapping `old_fd`) as the live handle.
        drop(fresh);
        self.carry.clear();
        Ok(())
    }
}

impl AsRawFd for Pipe {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn ensure_fifo(path: &str) -> io::Result<()> {
    if std::path::Path::new(path).exists() {
        return Ok(());
    }
    let c_path = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in path"))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // Another process may have raced us to create it.
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

fn open_nonblocking(path: &str) -> io::Result<FileDesc> {
    let c_path = CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in path"))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { FileDesc::new(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_lines_and_drops_invalid_ones() {
        let mut pipe_state = Pipe {
            path: String::new(),
            fd: unsafe { FileDesc::new(libc::dup(0)) },
            carry: Vec::new(),
            buf: [0u8; 4096],
        };
        pipe_state.carry.extend_from_slice(b"10.0.0.5:8080\nnotanendpoint\n10.0.0.9:1234\n");

        let found = pipe_state.take_complete_lines();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].to_string(), "10.0.0.5:8080");
        assert_eq!(found[1].to_string(), "10.0.0.9:1234");
    }

    #[test]
    fn holds_a_partial_trailing_line() {
        let mut pipe_state = Pipe {
            path: String::new(),
            fd: unsafe { FileDesc::new(libc::dup(0)) },
            carry: Vec::new(),
            buf: [0u8; 4096],
        };
        pipe_state.carry.extend_from_slice(b"10.0.0.5:8080\n10.0.0.9:12");

        let found = pipe_state.take_complete_lines();

        assert_eq!(found.len(), 1);
        assert_eq!(pipe_state.carry, b"10.0.0.9:12");
    }
}
