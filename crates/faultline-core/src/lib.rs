//! Lazily materialized memory objects backed by userfaultfd.
//!
//! An object is a reserved address range whose contents are produced on
//! demand: the first touch of each chunk suspends the touching thread while a
//! dedicated handler thread runs the object's population callback and
//! installs the result. Resident chunks are capped by a high/low watermark
//! pair; evicted chunks that were modified are kept in a per-object backing
//! file and restored on the next touch.

pub mod config;
pub mod fingerprint;
pub mod metrics;
pub mod page;
pub mod range_index;
pub mod ring;

mod backing;
mod handler;
mod instance;
mod protocol;
mod scratch;
mod sys;

pub use config::{
    ChunkSpan, EngineConfig, ObjectConfig, ObjectLayout, PopulateError, PopulateFn,
    PopulateRequest, UserData,
};
pub use faultline_error::{ErrorClass, ErrorCode, FaultError, Result};
pub use handler::POPULATE_PANIC_CODE;
pub use instance::{Instance, InstanceState, LazyObject};
pub use metrics::{EngineMetrics, EngineStats};
pub use protocol::ObjectId;
pub use range_index::{IndexError, RangeEntry, RangeIndex};
pub use ring::{EvictionRing, RingError};
