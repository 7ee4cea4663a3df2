//! Completion readiness signal
//!
//! A non-blocking eventfd the backing store bumps whenever it has finished
//! requests to hand back. The reactor polls the descriptor; the drain loop
//! reads and clears the counter to decide whether to go again.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// Non-blocking eventfd shared between the reactor and backing store threads
#[derive(Debug)]
pub struct CompletionSignal {
    fd: RawFd,
}

impl CompletionSignal {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(CompletionSignal { fd })
    }

    /// Add one to the pending counter, making the descriptor readable
    pub fn notify(&self) -> io::Result<()> {
        let val: u64 = 1;
        let rc = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated; the reader will observe a nonzero value anyway
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Read and clear the pending counter; 0 when nothing was pending
    pub fn take(&self) -> io::Result<u64> {
        let mut val: u64 = 0;
        let rc = unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, 8)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        Ok(val)
    }
}

impl AsRawFd for CompletionSignal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
