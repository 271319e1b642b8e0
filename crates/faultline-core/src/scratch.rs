//! Page-aligned population buffer, reused across faults and never shrunk.

use crate::page::{page_size, round_up};

pub struct ScratchBuffer {
    backing: Vec<u8>,
    offset: usize,
    len: usize,
}

impl ScratchBuffer {
    /// A buffer of at least `len` bytes (rounded up to a page).
    #[must_use]
    pub fn new(len: usize) -> Self {
        let len = round_up(len.max(1) as u64, page_size() as u64) as usize;
        let (backing, offset) = allocate_aligned(len);
        Self {
            backing,
            offset,
            len,
        }
    }

    /// The first `len` bytes, growing the buffer if it is smaller.
    ///
    /// Growth discards the previous contents.
    pub fn get(&mut self, len: usize) -> &mut [u8] {
        if len > self.len {
            *self = Self::new(len);
        }
        &mut self.backing[self.offset..self.offset + len]
    }
}

impl std::fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("capacity", &self.len)
            .finish_non_exhaustive()
    }
}

/// Over-allocate so a page-aligned run of `len` bytes fits.
fn allocate_aligned(len: usize) -> (Vec<u8>, usize) {
    let page = page_size();
    let backing = vec![0_u8; len + page - 1];
    let misalignment = backing.as_ptr() as usize & (page - 1);
    let offset = if misalignment == 0 {
        0
    } else {
        page - misalignment
    };
    debug_assert!(offset + len <= backing.len());
    (backing, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_page_rounded() {
        let page = page_size();
        let mut buf = ScratchBuffer::new(10);
        assert_eq!(buf.len, page);
        assert_eq!(buf.get(10).as_ptr() as usize % page, 0);
    }

    #[test]
    fn grows_never_shrinks() {
        let page = page_size();
        let mut buf = ScratchBuffer::new(page);
        assert_eq!(buf.get(3 * page + 1).len(), 3 * page + 1);
        assert_eq!(buf.len, 4 * page);
        assert_eq!(buf.get(8).len(), 8);
        assert_eq!(buf.len, 4 * page);
        assert_eq!(buf.get(page).as_ptr() as usize % page, 0);
    }
}
