//! eventfd used to wake the handler when a control request is queued.

use std::os::fd::{AsFd, BorrowedFd};

use faultline_error::{FaultError, Result};
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

/// Non-blocking counter descriptor; any non-zero value means "requests
/// pending".
#[derive(Debug)]
pub struct Doorbell {
    efd: EventFd,
}

impl Doorbell {
    pub fn new() -> Result<Self> {
        let efd = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map_err(|e| FaultError::resource("eventfd", e))?;
        Ok(Self { efd })
    }

    /// Signal the handler. A saturated counter already means "ring".
    pub fn ring(&self) -> Result<()> {
        match self.efd.write(1) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(FaultError::resource("eventfd write", e)),
        }
    }

    /// Reset the counter. Returns whether it had been rung.
    pub fn drain(&self) -> Result<bool> {
        match self.efd.read() {
            Ok(n) => Ok(n > 0),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(FaultError::resource("eventfd read", e)),
        }
    }
}

impl AsFd for Doorbell {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.efd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_then_drain() {
        let bell = Doorbell::new().unwrap();
        assert!(!bell.drain().unwrap());
        bell.ring().unwrap();
        bell.ring().unwrap();
        assert!(bell.drain().unwrap());
        assert!(!bell.drain().unwrap());
    }
}
