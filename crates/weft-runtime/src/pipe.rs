//! Anonymous pipe with independent write-end lifetime.
//!
//! The read end lives as long as the pipe; the write end may be closed
//! early to signal EOF to readers. Used by callers as a fiber-friendly
//! byte transport and internally by the splice helpers.

use std::os::unix::io::RawFd;

use weft_core::{Error, Result};

pub struct Pipe {
    fds: [RawFd; 2],
    write_closed: bool,
}

impl Pipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            fds,
            write_closed: false,
        })
    }

    /// The read (`false`) or write (`true`) descriptor. Asking for the
    /// write end of a closed pipe fails.
    pub fn fd(&self, write: bool) -> Result<RawFd> {
        if write {
            if self.write_closed {
                return Err(Error::ClosedPipe);
            }
            Ok(self.fds[1])
        } else {
            Ok(self.fds[0])
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.fds[0]
    }

    pub fn write_fd(&self) -> Result<RawFd> {
        self.fd(true)
    }

    /// Close the write end, delivering EOF to readers. The read end stays
    /// open until the pipe is dropped.
    pub fn close(&mut self) -> Result<()> {
        if self.write_closed {
            return Err(Error::ClosedPipe);
        }
        self.write_closed = true;
        crate::backend::close(self.fds[1])
    }

    /// Whether the write end is closed.
    pub fn closed(&self) -> bool {
        self.write_closed
    }

    pub fn fds(&self) -> (RawFd, RawFd) {
        (self.fds[0], self.fds[1])
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fds[0]);
            if !self.write_closed {
                libc::close(self.fds[1]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fd_accessors() {
        let pipe = Pipe::new().unwrap();
        assert!(pipe.fd(false).is_ok());
        assert!(pipe.fd(true).is_ok());
        assert!(!pipe.closed());
        let (r, w) = pipe.fds();
        assert_ne!(r, w);
    }

    #[test]
    fn test_write_fd_after_close_fails() {
        // Close the raw fd directly: `close()` goes through the backend,
        // which needs a runtime.
        let mut pipe = Pipe::new().unwrap();
        unsafe { libc::close(pipe.fds[1]) };
        pipe.write_closed = true;
        assert_eq!(pipe.fd(true), Err(Error::ClosedPipe));
        assert!(pipe.fd(false).is_ok());
    }
}
