//! Self-pipe used to signal a host thread about queued method requests.

use std::os::fd::RawFd;

use tracing::warn;

/// A non-blocking pipe pair.
///
/// The agent writes one byte per queued method request; the host polls
/// the read end (exposed through `signal_fd`) and the next
/// `poll_callbacks` drains whatever accumulated. Both ends close on
/// drop.
#[derive(Debug)]
pub struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalPipe {
    /// Create the pipe with both ends non-blocking.
    pub fn new() -> std::io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds points at a valid 2-element array for the duration
        // of the call.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: fd is a freshly created, owned descriptor.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            {
                let err = std::io::Error::last_os_error();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(SignalPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// The end the host polls.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Signal one queued request. A full pipe is fine: any pending byte
    /// already wakes the poller.
    pub fn signal(&self) {
        let byte = [b'X'];
        // SAFETY: write_fd is owned and open; the buffer outlives the call.
        let rc = unsafe { libc::write(self.write_fd, byte.as_ptr().cast(), 1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                warn!(error = %err, "Signal pipe write failed");
            }
        }
    }

    /// Consume every pending signal byte.
    pub fn drain(&self) {
        let mut buf = [0u8; 100];
        loop {
            // SAFETY: read_fd is owned and open; buf is valid for len bytes.
            let rc = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        // SAFETY: descriptors are owned and closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
