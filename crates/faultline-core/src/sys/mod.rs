//! Thin wrappers over the kernel facilities the engine is built on.

mod doorbell;
mod mapping;
mod poll;
mod uffd;

pub use doorbell::Doorbell;
pub use mapping::MappedRegion;
pub use poll::{Poller, Readiness, WaitOutcome};
pub use uffd::{CopyOutcome, Userfault, UserfaultEvent};
