//! Per-object backing store for chunks evicted after modification.
//!
//! An unlinked temporary file, mapped shared, laid out as
//!
//! ```text
//! [ dirty bitmap: one bit per chunk, page-rounded ][ payload: page-rounded body ]
//! ```
//!
//! Chunk `i` lives in the payload at the same offset it occupies in the
//! object body, and bit `i` says the payload copy is newer than what the
//! population callback would produce.

use std::path::Path;

use faultline_error::{FaultError, Result};

use crate::config::ObjectLayout;
use crate::page::{ceil_div, round_up_to_page};
use crate::sys::MappedRegion;

#[derive(Debug)]
pub struct BackingStore {
    map: MappedRegion,
    bitmap_len: usize,
    payload_len: usize,
    chunk_count: u64,
}

impl BackingStore {
    /// Create the store for an object with `layout`, in `dir`.
    ///
    /// The file is unlinked on creation and disappears with the mapping.
    pub fn create(dir: &Path, layout: &ObjectLayout) -> Result<Self> {
        let chunk_count = layout.chunk_count();
        let bitmap_len = to_usize(round_up_to_page(ceil_div(chunk_count, 8)))?;
        let payload_len = to_usize(layout.body_reserved)?;
        let total = bitmap_len + payload_len;
        if total == 0 {
            return Err(FaultError::invariant("backing store for an empty body"));
        }

        let file =
            tempfile::tempfile_in(dir).map_err(|e| FaultError::resource("create backing file", e))?;
        file.set_len(total as u64)
            .map_err(|e| FaultError::resource("size backing file", e))?;
        let map = MappedRegion::shared(&file, total)?;

        Ok(Self {
            map,
            bitmap_len,
            payload_len,
            chunk_count,
        })
    }

    /// Whether chunk `index` has a saved copy.
    pub fn is_dirty(&self, index: u64) -> Result<bool> {
        let (byte, mask) = self.bit(index)?;
        Ok(self.bitmap()[byte] & mask != 0)
    }

    /// Mark chunk `index` as saved.
    pub fn set_dirty(&mut self, index: u64) -> Result<()> {
        let (byte, mask) = self.bit(index)?;
        self.bitmap_mut()[byte] |= mask;
        Ok(())
    }

    /// Forget every saved chunk.
    pub fn clear_dirty(&mut self) {
        self.bitmap_mut().fill(0);
    }

    /// Number of chunks with a saved copy.
    #[must_use]
    pub fn dirty_count(&self) -> u64 {
        self.bitmap()
            .iter()
            .map(|b| u64::from(b.count_ones()))
            .sum()
    }

    /// Saved bytes at body offset `offset`.
    pub fn load(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_payload(offset, len)?;
        // SAFETY: file-backed memory owned by this store; never registered
        // for fault handling, and `&self` excludes writers.
        unsafe { self.map.bytes(self.bitmap_len + offset, len) }
    }

    /// Save `src` at body offset `offset`.
    pub fn store(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_payload(offset, src.len())?;
        // SAFETY: as in `load`; `&mut self` makes this the only alias.
        let dst = unsafe { self.map.bytes_mut(self.bitmap_len + offset, src.len()) }?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn bit(&self, index: u64) -> Result<(usize, u8)> {
        if index >= self.chunk_count {
            return Err(FaultError::invariant(format!(
                "chunk {index} outside backing bitmap of {} chunks",
                self.chunk_count
            )));
        }
        Ok(((index / 8) as usize, 1 << (index % 8)))
    }

    fn bitmap(&self) -> &[u8] {
        // SAFETY: the bitmap prefix is always in bounds of the mapping; see
        // `load` for aliasing.
        unsafe { self.map.bytes(0, self.bitmap_len) }.unwrap_or(&[])
    }

    fn bitmap_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `bitmap`, with `&mut self` as the only alias.
        unsafe { self.map.bytes_mut(0, self.bitmap_len) }.unwrap_or(&mut [])
    }

    fn check_payload(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.payload_len => Ok(()),
            _ => Err(FaultError::invariant(format!(
                "backing access {offset:#x}+{len:#x} past payload of {:#x} bytes",
                self.payload_len
            ))),
        }
    }
}

fn to_usize(n: u64) -> Result<usize> {
    usize::try_from(n).map_err(|_| FaultError::invariant(format!("{n} bytes exceeds address space")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObjectConfig;
    use crate::page::page_size;

    fn layout(elements: u64) -> ObjectLayout {
        ObjectConfig::new(0, elements, 8, 1).unwrap().layout()
    }

    #[test]
    fn sizes_follow_layout() {
        let dir = tempfile::tempdir().unwrap();
        let page = page_size();
        let l = layout(1000);
        let store = BackingStore::create(dir.path(), &l).unwrap();
        assert_eq!(store.payload_len, l.body_reserved as usize);
        assert_eq!(store.bitmap_len, page);
        assert_eq!(store.dirty_count(), 0);
        // The file is unlinked.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn dirty_bits_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(100_000);
        let chunks = l.chunk_count();
        assert!(chunks > 9);
        let mut store = BackingStore::create(dir.path(), &l).unwrap();

        store.set_dirty(0).unwrap();
        store.set_dirty(9).unwrap();
        assert!(store.is_dirty(0).unwrap());
        assert!(!store.is_dirty(1).unwrap());
        assert!(store.is_dirty(9).unwrap());
        assert_eq!(store.dirty_count(), 2);
        assert!(store.is_dirty(chunks).is_err());

        store.clear_dirty();
        assert_eq!(store.dirty_count(), 0);
    }

    #[test]
    fn store_and_load_at_chunk_offset() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(100_000);
        let mut store = BackingStore::create(dir.path(), &l).unwrap();
        let span = l.chunk(3);
        let data: Vec<u8> = (0..span.data_len).map(|i| (i % 251) as u8).collect();
        store.store(span.body_offset as usize, &data).unwrap();
        assert_eq!(
            store.load(span.body_offset as usize, data.len()).unwrap(),
            &data[..]
        );
        // Neighbouring chunk untouched.
        let next = l.chunk(4);
        assert!(store
            .load(next.body_offset as usize, 16)
            .unwrap()
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn last_chunk_fill_fits_payload() {
        let dir = tempfile::tempdir().unwrap();
        let l = layout(1001);
        let store = BackingStore::create(dir.path(), &l).unwrap();
        let last = l.chunk(l.chunk_count() - 1);
        assert!(store
            .load(last.body_offset as usize, last.fill_len as usize)
            .is_ok());
        assert!(store.load(store.payload_len, 1).is_err());
    }
}
