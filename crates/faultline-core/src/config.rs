//! Engine and object configuration.
//!
//! [`EngineConfig`] carries the per-instance knobs (memory watermarks, ring
//! and scratch sizing, poll behaviour, where backing files live).
//! [`ObjectConfig`] is the template objects are created from: element
//! geometry, the derived chunk granularity, and the population callback.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use faultline_error::{FaultError, Result};

use crate::page::{ceil_div, gcd, page_size, round_up_to_page};

/// Default high watermark: 2 GiB resident.
pub const DEFAULT_HIGH_WATERMARK: usize = 2 * 1024 * 1024 * 1024;
/// Default low watermark: 1 GiB resident.
pub const DEFAULT_LOW_WATERMARK: usize = 1024 * 1024 * 1024;
/// Default number of eviction records before the ring first grows.
pub const DEFAULT_RING_CAPACITY: usize = 1024;
/// Default initial scratch buffer, in pages.
pub const DEFAULT_SCRATCH_PAGES: usize = 20;
/// Default readiness-wait timeout.
pub const DEFAULT_POLL_TIMEOUT_MS: u16 = 200;
/// Default number of consecutive interrupted waits tolerated.
pub const DEFAULT_MAX_POLL_INTERRUPTS: u32 = 3;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Per-instance configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Resident bytes must never exceed this.
    pub high_watermark: usize,
    /// Eviction drains resident bytes down to this.
    pub low_watermark: usize,
    /// Initial eviction ring capacity, in records.
    pub ring_capacity: usize,
    /// Initial scratch buffer size, in pages.
    pub scratch_pages: usize,
    /// Upper bound on a single readiness wait.
    pub poll_timeout_ms: u16,
    /// Interrupted waits tolerated in a row before the handler gives up.
    pub max_poll_interrupts: u32,
    /// Directory holding the unlinked per-object backing files.
    pub backing_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            ring_capacity: DEFAULT_RING_CAPACITY,
            scratch_pages: DEFAULT_SCRATCH_PAGES,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            max_poll_interrupts: DEFAULT_MAX_POLL_INTERRUPTS,
            backing_dir: std::env::temp_dir(),
        }
    }
}

impl EngineConfig {
    /// Set both watermarks.
    #[must_use]
    pub fn with_memory_limits(mut self, high: usize, low: usize) -> Self {
        self.high_watermark = high;
        self.low_watermark = low;
        self
    }

    #[must_use]
    pub fn with_ring_capacity(mut self, records: usize) -> Self {
        self.ring_capacity = records;
        self
    }

    #[must_use]
    pub fn with_scratch_pages(mut self, pages: usize) -> Self {
        self.scratch_pages = pages;
        self
    }

    #[must_use]
    pub fn with_poll_timeout_ms(mut self, ms: u16) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_poll_interrupts(mut self, n: u32) -> Self {
        self.max_poll_interrupts = n;
        self
    }

    #[must_use]
    pub fn with_backing_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backing_dir = dir.into();
        self
    }

    /// Check the watermark ordering.
    ///
    /// # Errors
    ///
    /// [`FaultError::InvalidWatermarks`] unless `high > low`.
    pub fn validate(&self) -> Result<()> {
        check_watermarks(self.high_watermark, self.low_watermark)
    }
}

/// Reject watermark pairs where `high <= low`.
pub(crate) fn check_watermarks(high: usize, low: usize) -> Result<()> {
    if high <= low {
        return Err(FaultError::InvalidWatermarks { high, low });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Population callback
// ---------------------------------------------------------------------------

/// Opaque caller data handed back to the population callback.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// One population call: fill elements `start..end`.
pub struct PopulateRequest<'a> {
    /// First element to produce.
    pub start: u64,
    /// One past the last element to produce.
    pub end: u64,
    /// Bytes per element.
    pub stride: u32,
    user_data: Option<&'a UserData>,
}

impl<'a> PopulateRequest<'a> {
    pub(crate) fn new(start: u64, end: u64, stride: u32, user_data: Option<&'a UserData>) -> Self {
        Self {
            start,
            end,
            stride,
            user_data,
        }
    }

    /// Number of elements requested.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u64 {
        self.end - self.start
    }

    /// The user data attached to the object configuration, if it is a `T`.
    #[must_use]
    pub fn user_data<T: Any>(&self) -> Option<&'a T> {
        self.user_data.and_then(|d| d.downcast_ref::<T>())
    }

    /// The raw user data attached to the object configuration.
    #[must_use]
    pub fn raw_user_data(&self) -> Option<&'a UserData> {
        self.user_data
    }
}

/// Failure reported by a population callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulateError {
    pub code: i32,
}

impl PopulateError {
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Fills `out` (exactly `count() * stride` bytes) for the request.
///
/// Must not touch memory of objects on the same instance.
pub type PopulateFn =
    Arc<dyn Fn(&PopulateRequest<'_>, &mut [u8]) -> std::result::Result<(), PopulateError> + Send + Sync>;

// ---------------------------------------------------------------------------
// ObjectConfig
// ---------------------------------------------------------------------------

/// Template for lazily populated objects.
#[derive(Clone)]
pub struct ObjectConfig {
    header_size: u64,
    element_count: u64,
    stride: u32,
    objects_at_once: u64,
    read_only: bool,
    populate: Option<PopulateFn>,
    user_data: Option<UserData>,
}

impl ObjectConfig {
    /// Describe objects of `element_count` elements of `stride` bytes behind a
    /// `header_size`-byte header, populated at least `min_load_count`
    /// elements at a time.
    ///
    /// The chunk granularity is the smallest multiple of the page-aligned
    /// element run that covers `min_load_count`, so every chunk spans whole
    /// pages and a whole number of elements.
    ///
    /// # Errors
    ///
    /// [`FaultError::InvalidStride`] if `stride` is zero, and
    /// [`FaultError::ObjectTooLarge`] if the reserved range or one chunk would
    /// not fit the address space.
    pub fn new(header_size: u64, element_count: u64, stride: u32, min_load_count: u64) -> Result<Self> {
        if stride < 1 {
            return Err(FaultError::InvalidStride { stride });
        }
        let too_large = || FaultError::ObjectTooLarge {
            header_size,
            element_count,
            stride,
        };
        let page = page_size() as u64;
        let per_page_run = page / gcd(page, u64::from(stride));
        let min_load = min_load_count.max(1);
        let objects_at_once = per_page_run
            .checked_mul(ceil_div(min_load, per_page_run))
            .ok_or_else(too_large)?;
        checked_true_size(header_size, element_count, stride, objects_at_once)
            .ok_or_else(too_large)?;
        Ok(Self {
            header_size,
            element_count,
            stride,
            objects_at_once,
            read_only: false,
            populate: None,
            user_data: None,
        })
    }

    /// Install the population callback.
    pub fn set_populate_function<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&PopulateRequest<'_>, &mut [u8]) -> std::result::Result<(), PopulateError>
            + Send
            + Sync
            + 'static,
    {
        self.populate = Some(Arc::new(f));
        self
    }

    /// Attach data handed back to every population call.
    pub fn set_user_data(&mut self, data: UserData) -> &mut Self {
        self.user_data = Some(data);
        self
    }

    /// Never persist modifications of objects made from this configuration.
    pub fn set_read_only(&mut self) -> &mut Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Elements populated per chunk.
    #[must_use]
    pub fn objects_at_once(&self) -> u64 {
        self.objects_at_once
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn populate_fn(&self) -> Option<&PopulateFn> {
        self.populate.as_ref()
    }

    pub(crate) fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Address layout of objects made from this configuration.
    #[must_use]
    pub fn layout(&self) -> ObjectLayout {
        let body_len = self.element_count * u64::from(self.stride);
        ObjectLayout {
            header_size: self.header_size,
            header_padded: round_up_to_page(self.header_size),
            body_len,
            body_reserved: round_up_to_page(body_len),
            element_count: self.element_count,
            stride: self.stride,
            objects_at_once: self.objects_at_once,
        }
    }
}

/// Reserved bytes for the geometry, or `None` if any size along the way
/// overflows or the total exceeds `isize::MAX`.
fn checked_true_size(
    header_size: u64,
    element_count: u64,
    stride: u32,
    objects_at_once: u64,
) -> Option<u64> {
    let page = page_size() as u64;
    let stride = u64::from(stride);
    objects_at_once.checked_mul(stride)?;
    let body = element_count.checked_mul(stride)?.checked_next_multiple_of(page)?;
    let total = header_size.checked_next_multiple_of(page)?.checked_add(body)?;
    (total <= isize::MAX as u64).then_some(total)
}

impl fmt::Debug for ObjectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectConfig")
            .field("header_size", &self.header_size)
            .field("element_count", &self.element_count)
            .field("stride", &self.stride)
            .field("objects_at_once", &self.objects_at_once)
            .field("read_only", &self.read_only)
            .field("has_populate", &self.populate.is_some())
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ObjectLayout
// ---------------------------------------------------------------------------

/// Byte geometry of one object's reserved range.
///
/// ```text
/// base            header_ptr          body_ptr
///  |   padding    |   header bytes    |  body (chunks)  ...  | page tail |
///  |<-------- header_padded --------->|<----- body_reserved ----------->|
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    pub header_size: u64,
    pub header_padded: u64,
    pub body_len: u64,
    pub body_reserved: u64,
    pub element_count: u64,
    pub stride: u32,
    pub objects_at_once: u64,
}

/// One population chunk of an object body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Chunk number within the body.
    pub index: u64,
    /// First element covered.
    pub start: u64,
    /// One past the last element covered.
    pub end: u64,
    /// Offset of the chunk from the body start.
    pub body_offset: u64,
    /// Bytes the population callback produces.
    pub data_len: u64,
    /// Bytes installed by the fault, `data_len` rounded up to a page.
    pub fill_len: u64,
}

impl ObjectLayout {
    /// Whole reserved range: padded header plus page-rounded body.
    #[inline]
    #[must_use]
    pub fn true_size(&self) -> u64 {
        self.header_padded + self.body_reserved
    }

    /// Offset of the first header byte from the range base.
    #[inline]
    #[must_use]
    pub fn header_offset(&self) -> u64 {
        self.header_padded - self.header_size
    }

    /// Bytes in one full chunk.
    #[inline]
    #[must_use]
    pub fn chunk_bytes(&self) -> u64 {
        self.objects_at_once * u64::from(self.stride)
    }

    /// Number of chunks covering the body.
    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        ceil_div(self.element_count, self.objects_at_once)
    }

    /// The chunk containing the body byte at `body_offset`, or `None` past the
    /// last element.
    #[must_use]
    pub fn chunk_at(&self, body_offset: u64) -> Option<ChunkSpan> {
        if body_offset >= self.body_reserved {
            return None;
        }
        let index = body_offset / self.chunk_bytes();
        Some(self.chunk(index))
    }

    /// Geometry of chunk `index`; the final chunk is clipped to the element
    /// count and chunks past it are empty.
    #[must_use]
    pub fn chunk(&self, index: u64) -> ChunkSpan {
        let start = index
            .saturating_mul(self.objects_at_once)
            .min(self.element_count);
        let end = start
            .saturating_add(self.objects_at_once)
            .min(self.element_count);
        let data_len = (end - start) * u64::from(self.stride);
        ChunkSpan {
            index,
            start,
            end,
            body_offset: start * u64::from(self.stride),
            data_len,
            fill_len: round_up_to_page(data_len),
        }
    }
}
