//! Growable circular buffer used as the eviction queue.
//!
//! Records come out strictly in the order they went in. The ring grows by
//! 50% on a full push when the caller allows it; a resize keeps the queued
//! order intact even when the live records wrap past the end of the buffer.

use std::fmt;

use thiserror::Error;

/// Errors from [`EvictionRing`] mutations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The ring is full and growing was not allowed.
    #[error("eviction ring is full")]
    Full,
    /// A resize asked for fewer slots than the ring has.
    #[error("cannot shrink eviction ring from {capacity} to {requested} slots")]
    Shrink { capacity: usize, requested: usize },
}

/// FIFO ring of `Copy` records.
///
/// `head` is the slot the next push writes; `tail` is the oldest record.
pub struct EvictionRing<T> {
    buf: Vec<T>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T: Copy + Default> EvictionRing<T> {
    /// Create a ring with room for `capacity` records (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![T::default(); capacity.max(1)],
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Append `item` as the newest record.
    ///
    /// # Errors
    ///
    /// [`RingError::Full`] when the ring is full and `allow_grow` is false.
    pub fn push(&mut self, item: T, allow_grow: bool) -> Result<(), RingError> {
        if self.len == self.buf.len() {
            if !allow_grow {
                return Err(RingError::Full);
            }
            let cap = self.buf.len();
            self.resize(cap + (cap / 2).max(1))?;
        }
        self.buf[self.head] = item;
        self.head = (self.head + 1) % self.buf.len();
        self.len += 1;
        Ok(())
    }

    /// Remove and return the oldest record.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.buf[self.tail];
        self.tail = (self.tail + 1) % self.buf.len();
        self.len -= 1;
        Some(item)
    }

    /// Remove and return the newest record, undoing the last push.
    pub fn pop_newest(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let cap = self.buf.len();
        self.head = (self.head + cap - 1) % cap;
        self.len -= 1;
        Some(self.buf[self.head])
    }

    /// The oldest record, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        (self.len > 0).then(|| &self.buf[self.tail])
    }

    /// Visit every record, oldest first, allowing in-place edits.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut T)) {
        let cap = self.buf.len();
        for i in 0..self.len {
            f(&mut self.buf[(self.tail + i) % cap]);
        }
    }

    /// Records oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let cap = self.buf.len();
        (0..self.len).map(move |i| &self.buf[(self.tail + i) % cap])
    }

    /// Grow the ring to `new_capacity` slots.
    ///
    /// # Errors
    ///
    /// [`RingError::Shrink`] if `new_capacity` is below the current capacity.
    pub fn resize(&mut self, new_capacity: usize) -> Result<(), RingError> {
        let old = self.buf.len();
        if new_capacity < old {
            return Err(RingError::Shrink {
                capacity: old,
                requested: new_capacity,
            });
        }
        if new_capacity == old {
            return Ok(());
        }
        self.buf.resize(new_capacity, T::default());

        if self.len == 0 {
            self.head = 0;
            self.tail = 0;
        } else if self.head <= self.tail {
            // Live records are [tail, old) followed by [0, head). Move the
            // wrapped prefix to sit right after the old end. Destinations that
            // wrap again land below their source, so ascending order is safe.
            for i in 0..self.head {
                self.buf[(old + i) % new_capacity] = self.buf[i];
            }
            self.head = (old + self.head) % new_capacity;
        }
        Ok(())
    }
}

impl<T> fmt::Debug for EvictionRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionRing")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
