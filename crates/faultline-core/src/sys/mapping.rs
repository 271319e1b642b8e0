//! RAII guard over an `mmap`ed range.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use faultline_error::{FaultError, Result};
use nix::sys::mman::{MapFlags, MmapAdvise, ProtFlags, madvise, mmap, mmap_anonymous, munmap};
use tracing::warn;

/// A mapped address range, unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

// SAFETY: the region is plain process memory; the owner decides which thread
// touches it, and only the handler thread ever owns one.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Reserve `len` bytes of private, readable and writable address space.
    /// Nothing is committed until pages are touched or installed.
    pub fn anonymous(len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len).ok_or(FaultError::EmptyObject)?;
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
            )
        }
        .map_err(|e| FaultError::resource("mmap", e))?;
        Ok(Self { ptr, len })
    }

    /// Map the first `len` bytes of `file` shared, so stores reach the file.
    pub fn shared(file: &File, len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| FaultError::invariant("shared mapping of an empty file"))?;
        // SAFETY: the file is sized to at least `len` by the caller and the
        // mapping is only reached through this guard.
        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }
        .map_err(|e| FaultError::resource("mmap backing store", e))?;
        Ok(Self { ptr, len })
    }

    /// Base address.
    #[inline]
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Drop the physical pages behind `[offset, offset + len)` while keeping
    /// the mapping (and any fault registration) in place.
    pub fn release(&self, offset: usize, len: usize) -> Result<()> {
        self.check_bounds(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the subrange lies inside this mapping (checked above).
        let start = unsafe { self.ptr.byte_add(offset) };
        // SAFETY: dropping pages of our own mapping; later touches refault.
        unsafe { madvise(start, len, MmapAdvise::MADV_DONTNEED) }
            .map_err(|e| FaultError::resource("madvise", e))
    }

    /// Borrow `[offset, offset + len)`.
    ///
    /// # Safety
    ///
    /// Every page of the subrange must be readable without faulting into a
    /// handler that could be waiting on the caller, and no `&mut` alias may
    /// exist for the returned lifetime.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_bounds(offset, len)?;
        // SAFETY: in bounds; residency and aliasing are the caller's contract.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>().add(offset), len) })
    }

    /// Mutably borrow `[offset, offset + len)`.
    ///
    /// # Safety
    ///
    /// As for [`Self::bytes`], and no other alias may exist.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_bounds(offset, len)?;
        // SAFETY: in bounds; residency and aliasing are the caller's contract.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>().add(offset), len)
        })
    }

    /// Give up ownership without unmapping; the range stays mapped until the
    /// process exits.
    pub fn leak(self) {
        std::mem::forget(self);
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(FaultError::invariant(format!(
                "range {offset:#x}+{len:#x} outside mapping of {:#x} bytes",
                self.len
            ))),
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping this guard created and still
        // owns; no borrow handed out by `bytes` can outlive `self`.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!(
                target: "faultline.engine",
                addr = self.addr(),
                len = self.len,
                error = %e,
                "munmap failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::page_size;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn anonymous_is_zeroed_and_writable() {
        let page = page_size();
        let region = MappedRegion::anonymous(2 * page).unwrap();
        assert_eq!(region.addr() % page, 0);
        // SAFETY: plain anonymous memory, no handler involved.
        let bytes = unsafe { region.bytes_mut(0, 2 * page) }.unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[page] = 9;
        // SAFETY: as above.
        assert_eq!(unsafe { region.bytes(page, 1) }.unwrap(), &[9]);
    }

    #[test]
    fn release_drops_contents() {
        let page = page_size();
        let region = MappedRegion::anonymous(2 * page).unwrap();
        // SAFETY: plain anonymous memory.
        unsafe { region.bytes_mut(0, 2 * page) }.unwrap().fill(0xAB);
        region.release(page, page).unwrap();
        // SAFETY: as above.
        let bytes = unsafe { region.bytes(0, 2 * page) }.unwrap();
        assert!(bytes[..page].iter().all(|&b| b == 0xAB));
        assert!(bytes[page..].iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_bounds_rejected() {
        let page = page_size();
        let region = MappedRegion::anonymous(page).unwrap();
        assert!(region.release(page, 1).is_err());
        // SAFETY: the call fails before any memory is touched.
        assert!(unsafe { region.bytes(1, page) }.is_err());
    }

    #[test]
    fn leaked_region_stays_mapped() {
        let page = page_size();
        let region = MappedRegion::anonymous(page).unwrap();
        let addr = region.addr();
        // SAFETY: plain anonymous memory.
        unsafe { region.bytes_mut(0, 1) }.unwrap()[0] = 5;
        region.leak();
        // SAFETY: the mapping was never unmapped.
        assert_eq!(unsafe { *(addr as *const u8) }, 5);
        // SAFETY: the range is ours and nothing else refers to it.
        unsafe { munmap(NonNull::new(addr as *mut libc::c_void).unwrap(), page) }.unwrap();
    }

    #[test]
    fn empty_anonymous_rejected() {
        assert!(matches!(
            MappedRegion::anonymous(0),
            Err(FaultError::EmptyObject)
        ));
    }

    #[test]
    fn shared_mapping_writes_through() {
        let page = page_size();
        let mut file = tempfile::tempfile().unwrap();
        file.set_len(page as u64).unwrap();
        {
            let region = MappedRegion::shared(&file, page).unwrap();
            // SAFETY: file-backed memory sized above.
            unsafe { region.bytes_mut(10, 3) }.unwrap().copy_from_slice(b"abc");
        }
        let mut back = vec![0_u8; page];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut back).unwrap();
        assert_eq!(&back[10..13], b"abc");
    }
}
