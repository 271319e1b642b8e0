//! Client-side engine handle and object handles.
//!
//! [`Instance`] owns the lifecycle: configure, [`Instance::init`] to open the
//! userfaultfd and start the handler thread, create objects, then shut down.
//! Every method takes `&self`, so an instance can be shared between client
//! threads behind an `Arc`.
//!
//! ```no_run
//! use faultline_core::{Instance, ObjectConfig};
//!
//! let instance = Instance::new();
//! instance.set_memory_limits(64 << 20, 32 << 20)?;
//! instance.init()?;
//!
//! let mut config = ObjectConfig::new(0, 1 << 20, 8, 1)?;
//! config.set_populate_function(|req, out| {
//!     for (i, slot) in out.chunks_exact_mut(8).enumerate() {
//!         slot.copy_from_slice(&(req.start + i as u64).to_ne_bytes());
//!     }
//!     Ok(())
//! });
//! let object = instance.create_object(&config)?;
//! // SAFETY: not called from a populate callback of this instance.
//! let body = unsafe { object.body() };
//! let third = u64::from_ne_bytes(body[16..24].try_into().unwrap());
//! assert_eq!(third, 2);
//! object.destroy()?;
//! instance.shutdown(true)?;
//! # Ok::<(), faultline_core::FaultError>(())
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use faultline_error::{FaultError, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{EngineConfig, ObjectConfig, ObjectLayout, check_watermarks};
use crate::handler::Handler;
use crate::metrics::{EngineMetrics, EngineStats};
use crate::protocol::{ControlChannel, ObjectId, Request, control_channel};
use crate::sys::Userfault;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

struct Running {
    channel: Arc<ControlChannel>,
}

/// How the handler thread ended, once someone has joined it.
enum Exit {
    NotStarted,
    Pending(JoinHandle<Result<()>>),
    Done(Result<()>),
}

enum State {
    Uninitialized(EngineConfig),
    Running(Running),
    ShuttingDown(Running),
    Stopped,
}

/// One fault-handling engine.
pub struct Instance {
    state: Mutex<State>,
    /// Held across the join, so concurrent waiters queue behind the first.
    exit: Mutex<Exit>,
    metrics: Arc<EngineMetrics>,
    next_id: AtomicU64,
}

impl Instance {
    /// An un-started instance with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// An un-started instance with `config`.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            state: Mutex::new(State::Uninitialized(config)),
            exit: Mutex::new(Exit::NotStarted),
            metrics: Arc::new(EngineMetrics::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn state(&self) -> InstanceState {
        match &*self.state.lock() {
            State::Uninitialized(_) => InstanceState::Uninitialized,
            State::Running(_) => InstanceState::Running,
            State::ShuttingDown(_) => InstanceState::ShuttingDown,
            State::Stopped => InstanceState::Stopped,
        }
    }

    /// Set the memory watermarks. Only valid before [`Self::init`].
    pub fn set_memory_limits(&self, high: usize, low: usize) -> Result<()> {
        check_watermarks(high, low)?;
        match &mut *self.state.lock() {
            State::Uninitialized(config) => {
                config.high_watermark = high;
                config.low_watermark = low;
                Ok(())
            }
            _ => Err(FaultError::LimitsAfterInit),
        }
    }

    /// Open the userfaultfd and control channel and start the handler.
    ///
    /// On failure nothing is left running and the instance stays
    /// uninitialized.
    pub fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        let config = match &*state {
            State::Uninitialized(config) => config.clone(),
            _ => return Err(FaultError::AlreadyInitialized),
        };
        config.validate()?;

        let uffd = Userfault::open()?;
        let (channel, inbox) = control_channel()?;
        let handler = Handler::new(config, uffd, inbox, Arc::clone(&self.metrics))?;
        let join = thread::Builder::new()
            .name("faultline-handler".into())
            .spawn(move || handler.run())
            .map_err(|e| FaultError::resource("spawn fault handler", e))?;

        *self.exit.lock() = Exit::Pending(join);
        *state = State::Running(Running {
            channel: Arc::new(channel),
        });
        info!(target: "faultline.engine", "instance initialized");
        Ok(())
    }

    /// Reserve a new object shaped by `config`.
    ///
    /// The returned handle's memory is populated chunk by chunk on first
    /// touch.
    pub fn create_object(&self, config: &ObjectConfig) -> Result<LazyObject> {
        if config.populate_fn().is_none() {
            return Err(FaultError::MissingPopulateFunction);
        }
        let layout = config.layout();
        if layout.true_size() == 0 {
            return Err(FaultError::EmptyObject);
        }
        let channel = self.channel()?;
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let config = config.clone();
        let alloc = channel.call(
            |reply| Request::Allocate { id, config, reply },
            || Err(FaultError::ShuttingDown),
        )?;
        debug_assert_eq!(alloc.true_size as u64, layout.true_size());
        Ok(LazyObject {
            id,
            base: alloc.base,
            layout,
            channel,
            live: true,
        })
    }

    /// Ask the handler to stop. With `wait`, block until it has torn down
    /// and return its outcome; otherwise the handler finishes on its own and
    /// [`Self::await_shutdown`] collects the outcome later.
    pub fn shutdown(&self, wait: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Uninitialized(_) | State::Stopped => return Ok(()),
                State::Running(running) => {
                    // The handler may already be gone after a fatal error;
                    // joining reports that.
                    let _ = running.channel.send(Request::Shutdown);
                    *state = State::ShuttingDown(running);
                }
                other @ State::ShuttingDown(_) => *state = other,
            }
        }
        if wait { self.await_shutdown() } else { Ok(()) }
    }

    /// Wait for the handler thread to exit and return how it ended.
    ///
    /// Without a prior [`Self::shutdown`] this blocks until the handler stops
    /// on its own, which only a fatal error causes. Every caller, concurrent
    /// or later, gets the same outcome.
    pub fn await_shutdown(&self) -> Result<()> {
        if let State::Uninitialized(_) = &*self.state.lock() {
            return Err(FaultError::NotInitialized);
        }
        let outcome = {
            let mut exit = self.exit.lock();
            match std::mem::replace(&mut *exit, Exit::NotStarted) {
                // Stopped without ever running.
                Exit::NotStarted => return Ok(()),
                Exit::Done(outcome) => {
                    *exit = Exit::Done(outcome.clone());
                    return outcome;
                }
                Exit::Pending(join) => {
                    let outcome = join.join().unwrap_or(Err(FaultError::HandlerPanicked));
                    *exit = Exit::Done(outcome.clone());
                    outcome
                }
            }
        };
        *self.state.lock() = State::Stopped;
        info!(target: "faultline.engine", ok = outcome.is_ok(), "instance stopped");
        outcome
    }

    /// Current engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.metrics.snapshot()
    }

    fn channel(&self) -> Result<Arc<ControlChannel>> {
        match &*self.state.lock() {
            State::Running(r) => Ok(Arc::clone(&r.channel)),
            State::Uninitialized(_) => Err(FaultError::NotInitialized),
            State::ShuttingDown(_) | State::Stopped => Err(FaultError::ShuttingDown),
        }
    }
}

impl Default for Instance {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let State::Running(r) = self.state.get_mut() {
            let _ = r.channel.send(Request::Shutdown);
        }
        if let Exit::Pending(join) = std::mem::replace(self.exit.get_mut(), Exit::NotStarted) {
            match join.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "faultline.engine", error = %e, "handler failed before drop");
                }
                Err(_) => warn!(target: "faultline.engine", "handler panicked before drop"),
            }
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Handle to one lazily populated object.
///
/// Memory stays valid until the object is destroyed (or dropped) or its
/// instance shuts down. Reading or writing it must never happen from inside a
/// population callback of the same instance: the handler would wait on
/// itself.
pub struct LazyObject {
    id: ObjectId,
    base: usize,
    layout: ObjectLayout,
    channel: Arc<ControlChannel>,
    live: bool,
}

impl LazyObject {
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    /// First byte of the header. Pure arithmetic; touching it never faults.
    #[must_use]
    pub fn header_ptr(&self) -> *mut u8 {
        (self.base + self.layout.header_offset() as usize) as *mut u8
    }

    /// First byte of element 0.
    #[must_use]
    pub fn body_ptr(&self) -> *mut u8 {
        (self.base + self.layout.header_padded as usize) as *mut u8
    }

    #[must_use]
    pub fn header_len(&self) -> usize {
        self.layout.header_size as usize
    }

    /// `stride * element_count` bytes.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.layout.body_len as usize
    }

    /// The header bytes.
    ///
    /// # Safety
    ///
    /// The object must be live, and no mutable alias may exist.
    #[must_use]
    pub unsafe fn header(&self) -> &[u8] {
        // SAFETY: the header lies inside the mapping and is zero-filled at
        // allocation; liveness and aliasing are the caller's contract.
        unsafe { std::slice::from_raw_parts(self.header_ptr(), self.header_len()) }
    }

    /// The header bytes, mutably.
    ///
    /// # Safety
    ///
    /// As for [`Self::header`].
    pub unsafe fn header_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `header`; `&mut self` excludes handle-derived aliases.
        unsafe { std::slice::from_raw_parts_mut(self.header_ptr(), self.header_len()) }
    }

    /// The element bytes. Touching unpopulated chunks blocks the calling
    /// thread until the handler has populated them.
    ///
    /// # Safety
    ///
    /// The object must be live, the caller must not be running inside a
    /// population callback of this instance, and no mutable alias may exist.
    #[must_use]
    pub unsafe fn body(&self) -> &[u8] {
        // SAFETY: the body lies inside the mapping; see the contract above.
        unsafe { std::slice::from_raw_parts(self.body_ptr(), self.body_len()) }
    }

    /// The element bytes, mutably. Changes survive eviction.
    ///
    /// # Safety
    ///
    /// As for [`Self::body`].
    pub unsafe fn body_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `body`.
        unsafe { std::slice::from_raw_parts_mut(self.body_ptr(), self.body_len()) }
    }

    /// Drop every populated chunk and saved modification; the next touch
    /// populates from scratch.
    pub fn reset(&self) -> Result<()> {
        let id = self.id;
        self.channel.call(
            |reply| Request::Reset { id, reply },
            || Err(FaultError::ShuttingDown),
        )
    }

    /// Unmap the object. Every chunk record it owns is retired first.
    pub fn destroy(mut self) -> Result<()> {
        self.live = false;
        self.free()
    }

    fn free(&self) -> Result<()> {
        let id = self.id;
        let res = self
            .channel
            .call(|reply| Request::Free { id, reply }, || Ok(()));
        match res {
            // Teardown already released every object's mapping.
            Err(FaultError::ShuttingDown) => Ok(()),
            other => other,
        }
    }
}

impl Drop for LazyObject {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.free() {
                warn!(target: "faultline.object", id = %self.id, error = %e, "free on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for LazyObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyObject")
            .field("id", &self.id)
            .field("base", &format_args!("{:#x}", self.base))
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_validated_and_frozen_by_state() {
        let inst = Instance::new();
        assert!(matches!(
            inst.set_memory_limits(5, 5),
            Err(FaultError::InvalidWatermarks { high: 5, low: 5 })
        ));
        inst.set_memory_limits(10, 5).unwrap();
        *inst.state.lock() = State::Stopped;
        assert!(matches!(
            inst.set_memory_limits(20, 5),
            Err(FaultError::LimitsAfterInit)
        ));
    }

    #[test]
    fn create_before_init() {
        let inst = Instance::new();
        let mut cfg = ObjectConfig::new(0, 10, 8, 1).unwrap();
        assert!(matches!(
            inst.create_object(&cfg),
            Err(FaultError::MissingPopulateFunction)
        ));
        cfg.set_populate_function(|_, _| Ok(()));
        assert!(matches!(
            inst.create_object(&cfg),
            Err(FaultError::NotInitialized)
        ));
    }

    #[test]
    fn empty_object_rejected() {
        let inst = Instance::new();
        let mut cfg = ObjectConfig::new(0, 0, 8, 1).unwrap();
        cfg.set_populate_function(|_, _| Ok(()));
        assert!(matches!(
            inst.create_object(&cfg),
            Err(FaultError::EmptyObject)
        ));
    }

    #[test]
    fn shutdown_and_await_without_init() {
        let inst = Instance::new();
        assert!(matches!(
            inst.await_shutdown(),
            Err(FaultError::NotInitialized)
        ));
        inst.shutdown(true).unwrap();
        assert_eq!(inst.state(), InstanceState::Stopped);
        inst.await_shutdown().unwrap();
    }

    #[test]
    fn every_waiter_sees_the_handler_outcome() {
        let inst = Arc::new(Instance::new());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let join: JoinHandle<Result<()>> = thread::spawn(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            Err(FaultError::BudgetExhausted {
                needed: 2,
                resident: 0,
                low: 1,
            })
        });
        started_rx.recv().unwrap();
        *inst.exit.lock() = Exit::Pending(join);
        *inst.state.lock() = State::ShuttingDown(Running {
            channel: Arc::new(control_channel().unwrap().0),
        });

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let inst = Arc::clone(&inst);
                thread::spawn(move || inst.await_shutdown())
            })
            .collect();
        release_tx.send(()).unwrap();
        for w in waiters {
            assert!(matches!(
                w.join().unwrap(),
                Err(FaultError::BudgetExhausted { .. })
            ));
        }
        assert_eq!(inst.state(), InstanceState::Stopped);
        assert!(matches!(
            inst.await_shutdown(),
            Err(FaultError::BudgetExhausted { .. })
        ));
        // Stopped instances report success for a repeated shutdown request.
        inst.shutdown(true).unwrap();
    }

    #[test]
    fn stats_start_at_zero() {
        let inst = Instance::new();
        assert_eq!(inst.stats(), EngineStats::default());
        assert_eq!(inst.state(), InstanceState::Uninitialized);
    }
}
