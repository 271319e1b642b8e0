//! userfaultfd descriptor: open, API handshake, range registration and the
//! fault-resolution primitives (copy, zero-page, wake).

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use faultline_error::{FaultError, Result};
use nix::errno::Errno;
use tracing::debug;

use crate::page::page_size;

mod abi {
    //! Layouts and request codes from `<linux/userfaultfd.h>`.

    use nix::{ioctl_read, ioctl_readwrite};

    pub const UFFD_API: u64 = 0xAA;
    pub const UFFD_USER_MODE_ONLY: libc::c_int = 1;
    pub const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;
    pub const UFFD_EVENT_PAGEFAULT: u8 = 0x12;

    pub const UFFDIO_WAKE_BIT: u64 = 1 << 0x02;
    pub const UFFDIO_COPY_BIT: u64 = 1 << 0x03;
    pub const UFFDIO_ZEROPAGE_BIT: u64 = 1 << 0x04;

    /// Size of `struct uffd_msg`.
    pub const MSG_SIZE: usize = 32;
    /// Offset of `arg.pagefault.address` inside `struct uffd_msg`.
    pub const MSG_ADDRESS_OFFSET: usize = 16;

    const UFFDIO: u8 = 0xAA;

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct UffdioApi {
        pub api: u64,
        pub features: u64,
        pub ioctls: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UffdioRange {
        pub start: u64,
        pub len: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct UffdioRegister {
        pub range: UffdioRange,
        pub mode: u64,
        pub ioctls: u64,
    }

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct UffdioCopy {
        pub dst: u64,
        pub src: u64,
        pub len: u64,
        pub mode: u64,
        pub copy: i64,
    }

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct UffdioZeropage {
        pub range: UffdioRange,
        pub mode: u64,
        pub zeropage: i64,
    }

    ioctl_readwrite!(uffdio_api, UFFDIO, 0x3F, UffdioApi);
    ioctl_readwrite!(uffdio_register, UFFDIO, 0x00, UffdioRegister);
    ioctl_read!(uffdio_unregister, UFFDIO, 0x01, UffdioRange);
    ioctl_read!(uffdio_wake, UFFDIO, 0x02, UffdioRange);
    ioctl_readwrite!(uffdio_copy, UFFDIO, 0x03, UffdioCopy);
    ioctl_readwrite!(uffdio_zeropage, UFFDIO, 0x04, UffdioZeropage);
}

/// Zero-progress `EAGAIN`s tolerated on one copy before giving up.
const MAX_COPY_STALLS: u32 = 64;

/// A message read from the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserfaultEvent {
    /// A thread touched a missing page; `address` is page-aligned.
    PageFault { address: usize },
    /// Any other event kind (not requested, logged and ignored).
    Other(u8),
}

/// Result of installing bytes into a registered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Installed,
    /// Another resolution already populated the range.
    AlreadyPresent,
}

/// Owned userfaultfd descriptor.
#[derive(Debug)]
pub struct Userfault {
    file: File,
}

impl Userfault {
    /// Open a non-blocking, close-on-exec descriptor and negotiate the API.
    ///
    /// When the kernel refuses unrestricted fault handling to this process,
    /// the open is retried for user-mode faults only, which is all the engine
    /// needs.
    pub fn open() -> Result<Self> {
        let flags = libc::O_CLOEXEC | libc::O_NONBLOCK;
        let fd = match open_raw(flags) {
            Err(Errno::EPERM) => {
                debug!(
                    target: "faultline.compat",
                    "userfaultfd refused; retrying with user-mode-only faults"
                );
                open_raw(flags | abi::UFFD_USER_MODE_ONLY)
            }
            other => other,
        }
        .map_err(|e| FaultError::resource("userfaultfd", e))?;

        let uffd = Self {
            file: File::from(fd),
        };
        uffd.handshake()?;
        Ok(uffd)
    }

    fn handshake(&self) -> Result<()> {
        let mut api = abi::UffdioApi {
            api: abi::UFFD_API,
            ..Default::default()
        };
        // SAFETY: `api` is a live, correctly laid out `uffdio_api`.
        unsafe { abi::uffdio_api(self.raw(), &mut api) }
            .map_err(|e| FaultError::resource("UFFDIO_API", e))?;
        if api.api != abi::UFFD_API {
            return Err(FaultError::resource(
                "UFFDIO_API",
                io::Error::new(io::ErrorKind::Unsupported, "userfaultfd API version mismatch"),
            ));
        }
        Ok(())
    }

    /// Register `[start, start + len)` for missing-page notification.
    pub fn register(&self, start: usize, len: usize) -> Result<()> {
        let mut reg = abi::UffdioRegister {
            range: range(start, len),
            mode: abi::UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        // SAFETY: `reg` is a live, correctly laid out `uffdio_register`.
        unsafe { abi::uffdio_register(self.raw(), &mut reg) }
            .map_err(|e| FaultError::resource("UFFDIO_REGISTER", e))?;

        let needed = abi::UFFDIO_WAKE_BIT | abi::UFFDIO_COPY_BIT | abi::UFFDIO_ZEROPAGE_BIT;
        if reg.ioctls & needed != needed {
            // Best effort; the range is unusable either way.
            let _ = self.unregister(start, len);
            return Err(FaultError::resource(
                "UFFDIO_REGISTER",
                io::Error::new(
                    io::ErrorKind::Unsupported,
                    "range does not support copy, zero-page and wake",
                ),
            ));
        }
        Ok(())
    }

    /// Stop fault notification for `[start, start + len)`.
    pub fn unregister(&self, start: usize, len: usize) -> Result<()> {
        let mut r = range(start, len);
        // SAFETY: `r` is a live, correctly laid out `uffdio_range`.
        unsafe { abi::uffdio_unregister(self.raw(), &mut r) }
            .map_err(|e| FaultError::resource("UFFDIO_UNREGISTER", e))?;
        Ok(())
    }

    /// Map zero pages over `[start, start + len)`.
    pub fn zeropage(&self, start: usize, len: usize) -> Result<()> {
        let mut z = abi::UffdioZeropage {
            range: range(start, len),
            mode: 0,
            zeropage: 0,
        };
        // SAFETY: `z` is a live, correctly laid out `uffdio_zeropage`.
        match unsafe { abi::uffdio_zeropage(self.raw(), &mut z) } {
            Ok(_) | Err(Errno::EEXIST) => Ok(()),
            Err(e) => Err(FaultError::resource("UFFDIO_ZEROPAGE", e)),
        }
    }

    /// Install `src` at `dst`, waking the faulting threads.
    ///
    /// Partial completions are continued from where the kernel stopped.
    pub fn copy(&self, dst: usize, src: &[u8]) -> Result<CopyOutcome> {
        let len = src.len();
        let mut done = 0_usize;
        let mut stalls = 0_u32;
        while done < len {
            let mut c = abi::UffdioCopy {
                dst: (dst + done) as u64,
                src: src[done..].as_ptr() as u64,
                len: (len - done) as u64,
                mode: 0,
                copy: 0,
            };
            // SAFETY: `c` is a live `uffdio_copy` whose source points into
            // `src`, which outlives the call.
            let res = unsafe { abi::uffdio_copy(self.raw(), &mut c) };
            let progressed = usize::try_from(c.copy).unwrap_or(0);
            match res {
                Ok(_) => done += if progressed == 0 { len - done } else { progressed },
                Err(Errno::EAGAIN) if progressed > 0 => done += progressed,
                Err(Errno::EAGAIN) => {
                    stalls += 1;
                    if stalls > MAX_COPY_STALLS {
                        return Err(FaultError::resource("UFFDIO_COPY", Errno::EAGAIN));
                    }
                }
                Err(Errno::EEXIST) => return Ok(CopyOutcome::AlreadyPresent),
                Err(e) => return Err(FaultError::resource("UFFDIO_COPY", e)),
            }
        }
        Ok(CopyOutcome::Installed)
    }

    /// Wake threads blocked on `[start, start + len)`.
    pub fn wake(&self, start: usize, len: usize) -> Result<()> {
        let mut r = range(start, len);
        // SAFETY: `r` is a live, correctly laid out `uffdio_range`.
        unsafe { abi::uffdio_wake(self.raw(), &mut r) }
            .map_err(|e| FaultError::resource("UFFDIO_WAKE", e))?;
        Ok(())
    }

    /// Read one pending message, or `None` if nothing is queued.
    pub fn read_event(&self) -> Result<Option<UserfaultEvent>> {
        let mut buf = [0_u8; abi::MSG_SIZE];
        let n = match (&self.file).read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(FaultError::resource("read userfaultfd", e)),
        };
        if n != abi::MSG_SIZE {
            return Err(FaultError::invariant(format!(
                "short userfaultfd message: {n} bytes"
            )));
        }
        Ok(Some(decode(&buf)))
    }

    fn raw(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for Userfault {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

fn open_raw(flags: libc::c_int) -> std::result::Result<OwnedFd, Errno> {
    // SAFETY: userfaultfd takes a flags word and returns a new descriptor.
    let ret = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
    if ret < 0 {
        return Err(Errno::last());
    }
    let raw = RawFd::try_from(ret).map_err(|_| Errno::EBADF)?;
    // SAFETY: `raw` was just returned by the kernel and nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn range(start: usize, len: usize) -> abi::UffdioRange {
    abi::UffdioRange {
        start: start as u64,
        len: len as u64,
    }
}

fn decode(msg: &[u8; abi::MSG_SIZE]) -> UserfaultEvent {
    if msg[0] != abi::UFFD_EVENT_PAGEFAULT {
        return UserfaultEvent::Other(msg[0]);
    }
    let mut addr = [0_u8; 8];
    addr.copy_from_slice(&msg[abi::MSG_ADDRESS_OFFSET..abi::MSG_ADDRESS_OFFSET + 8]);
    let address = u64::from_ne_bytes(addr) as usize;
    UserfaultEvent::PageFault {
        address: address & !(page_size() - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_layouts() {
        use std::mem::size_of;
        assert_eq!(size_of::<abi::UffdioApi>(), 24);
        assert_eq!(size_of::<abi::UffdioRange>(), 16);
        assert_eq!(size_of::<abi::UffdioRegister>(), 32);
        assert_eq!(size_of::<abi::UffdioCopy>(), 40);
        assert_eq!(size_of::<abi::UffdioZeropage>(), 32);
    }

    #[test]
    fn decode_pagefault_masks_to_page() {
        let page = page_size();
        let mut msg = [0_u8; abi::MSG_SIZE];
        msg[0] = abi::UFFD_EVENT_PAGEFAULT;
        let raw = (7 * page + 123) as u64;
        msg[16..24].copy_from_slice(&raw.to_ne_bytes());
        assert_eq!(
            decode(&msg),
            UserfaultEvent::PageFault {
                address: 7 * page
            }
        );
    }

    #[test]
    fn decode_other_event() {
        let mut msg = [0_u8; abi::MSG_SIZE];
        msg[0] = 0x14;
        assert_eq!(decode(&msg), UserfaultEvent::Other(0x14));
    }
}
