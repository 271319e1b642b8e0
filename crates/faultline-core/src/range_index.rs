//! Sorted, array-backed index from non-overlapping address ranges to owners.
//!
//! Entries live in one `Vec` ordered by base address and are found by binary
//! search. Removal leaves a tombstone that keeps its base address, so the
//! array stays sorted without compaction. Insertion reuses a tombstone when
//! one sits at the insertion point; otherwise it shifts entries toward the
//! nearest tombstone (or the end of the array when that is closer and spare
//! capacity exists), and only grows the allocation, by 50%, when every slot
//! is occupied.
//!
//! The engine consults the index once per page fault and once per free, so
//! lookup speed is favoured over keeping removal cheap.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Number of slots allocated for an empty index.
const INITIAL_SLOTS: usize = 8;

/// Failure modes of [`RangeIndex`] mutations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    /// The range overlaps a live entry (or wraps the address space).
    #[error("range overlaps an existing entry")]
    Conflict,
    /// No live entry starts at the given base address.
    #[error("no entry at that address")]
    NotFound,
    /// Zero-length ranges cannot be indexed.
    #[error("empty range")]
    EmptyRange,
}

/// A live entry returned by lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry<V> {
    pub base: usize,
    pub len: usize,
    pub owner: V,
}

impl<V> RangeEntry<V> {
    /// One past the last address covered by this entry.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.base + self.len
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot<V> {
    base: usize,
    len: usize,
    owner: Option<V>,
}

impl<V> Slot<V> {
    #[inline]
    const fn vacant(base: usize) -> Self {
        Self {
            base,
            len: 0,
            owner: None,
        }
    }

    #[inline]
    const fn is_occupied(&self) -> bool {
        self.owner.is_some()
    }

    /// Where `addr` lies relative to this slot. Tombstones only match their
    /// exact base.
    #[inline]
    fn locate(&self, addr: usize) -> Ordering {
        if addr < self.base {
            Ordering::Less
        } else if self.is_occupied() && addr - self.base < self.len {
            Ordering::Equal
        } else if !self.is_occupied() && addr == self.base {
            Ordering::Equal
        } else {
            Ordering::Greater
        }
    }
}

enum Probe {
    /// Slot `i` contains the address (or is a tombstone based exactly there).
    Hit(usize),
    /// The address belongs between slots `i - 1` and `i`.
    Miss(usize),
}

/// Address-range index keyed by base address.
pub struct RangeIndex<V> {
    slots: Vec<Slot<V>>,
    live: usize,
}

impl<V: Copy> RangeIndex<V> {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(INITIAL_SLOTS),
            live: 0,
        }
    }

    /// Number of live entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if no live entry exists.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots in use, live entries plus tombstones.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Index `[base, base + len)` under `owner`.
    ///
    /// # Errors
    ///
    /// [`IndexError::Conflict`] if the range overlaps any live entry,
    /// [`IndexError::EmptyRange`] if `len` is zero.
    pub fn insert(&mut self, base: usize, len: usize, owner: V) -> Result<(), IndexError> {
        if len == 0 {
            return Err(IndexError::EmptyRange);
        }
        let end = base.checked_add(len).ok_or(IndexError::Conflict)?;

        let idx = match self.search(base) {
            Probe::Hit(i) if self.slots[i].is_occupied() => return Err(IndexError::Conflict),
            Probe::Hit(i) | Probe::Miss(i) => i,
        };

        // The base is clear; the tail of the range must not reach the next
        // live entry either.
        if self.slots[idx..]
            .iter()
            .find(|s| s.is_occupied())
            .is_some_and(|next| next.base < end)
        {
            return Err(IndexError::Conflict);
        }

        let at = if idx < self.slots.len() && !self.slots[idx].is_occupied() {
            idx
        } else {
            self.make_room(idx, base)
        };

        self.slots[at] = Slot {
            base,
            len,
            owner: Some(owner),
        };
        // Tombstones inside the new range would break the search order.
        let tail = at + 1;
        let swallowed = self.slots[tail..]
            .iter()
            .take_while(|s| !s.is_occupied() && s.base < end)
            .count();
        if swallowed > 0 {
            self.slots.drain(tail..tail + swallowed);
        }
        self.live += 1;
        self.debug_check_sorted();
        Ok(())
    }

    /// Remove the entry that starts exactly at `base`, returning its owner.
    ///
    /// # Errors
    ///
    /// [`IndexError::NotFound`] if no live entry starts at `base`.
    pub fn remove(&mut self, base: usize) -> Result<V, IndexError> {
        let Probe::Hit(i) = self.search(base) else {
            return Err(IndexError::NotFound);
        };
        let slot = &mut self.slots[i];
        if slot.base != base {
            return Err(IndexError::NotFound);
        }
        let owner = slot.owner.take().ok_or(IndexError::NotFound)?;
        slot.len = 0;
        self.live -= 1;
        Ok(owner)
    }

    /// Owner of the live range containing `addr`.
    #[inline]
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<V> {
        self.find_entry(addr).map(|e| e.owner)
    }

    /// The live entry containing `addr`, with its bounds.
    #[must_use]
    pub fn find_entry(&self, addr: usize) -> Option<RangeEntry<V>> {
        match self.search(addr) {
            Probe::Hit(i) => {
                let slot = &self.slots[i];
                slot.owner.map(|owner| RangeEntry {
                    base: slot.base,
                    len: slot.len,
                    owner,
                })
            }
            Probe::Miss(_) => None,
        }
    }

    /// Live entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = RangeEntry<V>> + '_ {
        self.slots.iter().filter_map(|s| {
            s.owner.map(|owner| RangeEntry {
                base: s.base,
                len: s.len,
                owner,
            })
        })
    }

    /// Remove every entry, yielding the live ones in address order.
    pub fn drain(&mut self) -> impl Iterator<Item = RangeEntry<V>> + '_ {
        self.live = 0;
        self.slots.drain(..).filter_map(|s| {
            s.owner.map(|owner| RangeEntry {
                base: s.base,
                len: s.len,
                owner,
            })
        })
    }

    fn search(&self, addr: usize) -> Probe {
        let (mut lo, mut hi) = (0, self.slots.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.slots[mid].locate(addr) {
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
                Ordering::Equal => return Probe::Hit(mid),
            }
        }
        Probe::Miss(lo)
    }

    /// Open a free slot for an entry that belongs at `idx`, returning the
    /// index of that slot. `idx` is either occupied or one past the end.
    fn make_room(&mut self, idx: usize, base: usize) -> usize {
        let top = self.slots.len();

        if self.live < top {
            // A tombstone exists somewhere; shift toward whichever is nearest.
            let reach = idx.max(top - idx);
            let may_grow = top < self.slots.capacity();
            for d in 1..=reach {
                if let Some(lo) = idx.checked_sub(d) {
                    if !self.slots[lo].is_occupied() {
                        self.slots[lo..idx].rotate_left(1);
                        return idx - 1;
                    }
                }
                let hi = idx + d;
                if hi < top && !self.slots[hi].is_occupied() {
                    self.slots[idx..=hi].rotate_right(1);
                    return idx;
                }
                if may_grow && hi == top {
                    break;
                }
            }
        }

        if self.slots.len() == self.slots.capacity() {
            let grow = (self.slots.capacity() >> 1).max(INITIAL_SLOTS);
            self.slots.reserve_exact(grow);
        }
        self.slots.insert(idx, Slot::vacant(base));
        idx
    }

    #[cfg(debug_assertions)]
    fn debug_check_sorted(&self) {
        let mut live = 0;
        for pair in self.slots.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            debug_assert!(a.base < b.base, "range index out of order");
            if a.is_occupied() {
                debug_assert!(a.base + a.len <= b.base, "live ranges overlap");
            }
        }
        for s in &self.slots {
            live += usize::from(s.is_occupied());
        }
        debug_assert_eq!(live, self.live, "live count drifted");
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn debug_check_sorted(&self) {}
}

impl<V: Copy> Default for RangeIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for RangeIndex<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeIndex")
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}
