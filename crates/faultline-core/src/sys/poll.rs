//! epoll set watching the fault descriptor and the control doorbell.

use std::os::fd::AsFd;

use faultline_error::{FaultError, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

const FAULT_TOKEN: u64 = 1;
const CONTROL_TOKEN: u64 = 2;

/// Which sources became readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub fault: bool,
    pub control: bool,
}

/// Result of one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready(Readiness),
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
pub struct Poller {
    epoll: Epoll,
    timeout_ms: u16,
}

impl Poller {
    /// Watch `fault` and `control` for readability.
    pub fn new(fault: impl AsFd, control: impl AsFd, timeout_ms: u16) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| FaultError::resource("epoll_create", e))?;
        epoll
            .add(fault, EpollEvent::new(EpollFlags::EPOLLIN, FAULT_TOKEN))
            .map_err(|e| FaultError::resource("epoll_ctl fault", e))?;
        epoll
            .add(control, EpollEvent::new(EpollFlags::EPOLLIN, CONTROL_TOKEN))
            .map_err(|e| FaultError::resource("epoll_ctl control", e))?;
        Ok(Self { epoll, timeout_ms })
    }

    /// Block until a source is readable, the timeout passes, or a signal
    /// interrupts the wait.
    pub fn wait(&self) -> Result<WaitOutcome> {
        let mut events = [EpollEvent::empty(); 2];
        let n = match self.epoll.wait(&mut events, EpollTimeout::from(self.timeout_ms)) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(WaitOutcome::Interrupted),
            Err(e) => return Err(FaultError::resource("epoll_wait", e)),
        };
        if n == 0 {
            return Ok(WaitOutcome::TimedOut);
        }
        let mut ready = Readiness::default();
        for ev in &events[..n] {
            match ev.data() {
                FAULT_TOKEN => ready.fault = true,
                CONTROL_TOKEN => ready.control = true,
                _ => {}
            }
        }
        Ok(WaitOutcome::Ready(ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::Doorbell;

    #[test]
    fn times_out_then_sees_doorbell() {
        let fault = Doorbell::new().unwrap();
        let control = Doorbell::new().unwrap();
        let poller = Poller::new(&fault, &control, 10).unwrap();
        assert_eq!(poller.wait().unwrap(), WaitOutcome::TimedOut);

        control.ring().unwrap();
        assert_eq!(
            poller.wait().unwrap(),
            WaitOutcome::Ready(Readiness {
                fault: false,
                control: true
            })
        );
        control.drain().unwrap();
        assert_eq!(poller.wait().unwrap(), WaitOutcome::TimedOut);
    }
}
