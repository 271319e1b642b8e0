//! The fault-handling thread.
//!
//! One handler runs per instance and is the only code that touches the range
//! index, the eviction ring, object mappings and backing stores. It waits on
//! two sources: the userfaultfd, where page-fault events arrive, and the
//! control doorbell, which client threads ring after queueing a request.
//!
//! Fault resolution, for the chunk containing the faulting address:
//!
//! 1. Make room: once resident bytes plus the incoming chunk would pass the
//!    high watermark, reclaim the oldest chunks until under the low
//!    watermark. Running out of chunks first is fatal.
//! 2. Source the bytes from the backing store if the chunk was evicted after
//!    being modified, or from the population callback otherwise.
//! 3. Fingerprint them, record the chunk in the ring and count it resident,
//!    then install it with `UFFDIO_COPY`, which wakes the faulting thread.
//!
//! Reclaim compares a chunk's current fingerprint with the one taken at
//! population time and writes changed chunks back before dropping the pages.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use faultline_error::{FaultError, Result};
use nix::errno::Errno;
use tracing::{debug, error, info, trace, warn};

use crate::backing::BackingStore;
use crate::config::{ChunkSpan, EngineConfig, ObjectConfig, ObjectLayout, PopulateRequest};
use crate::fingerprint::Fingerprint;
use crate::metrics::EngineMetrics;
use crate::page::page_size;
use crate::protocol::{Allocation, ControlInbox, ObjectId, Reply, Request};
use crate::range_index::RangeIndex;
use crate::ring::EvictionRing;
use crate::scratch::ScratchBuffer;
use crate::sys::{CopyOutcome, MappedRegion, Poller, Userfault, UserfaultEvent, WaitOutcome};

/// Status reported for a population callback that panicked.
pub const POPULATE_PANIC_CODE: i32 = i32::MIN;

/// One populated chunk, in population order. `len == 0` marks a record whose
/// chunk was already released.
#[derive(Debug, Clone, Copy, Default)]
struct ChunkRecord {
    addr: usize,
    len: usize,
    fingerprint: Fingerprint,
    owner: ObjectId,
    chunk: u64,
}

struct ObjectState {
    region: MappedRegion,
    layout: ObjectLayout,
    config: ObjectConfig,
    /// Absent for read-only objects and objects without a body.
    backing: Option<BackingStore>,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Handler {
    config: EngineConfig,
    uffd: Userfault,
    poller: Poller,
    inbox: ControlInbox,
    index: RangeIndex<ObjectId>,
    objects: HashMap<ObjectId, ObjectState>,
    ring: EvictionRing<ChunkRecord>,
    scratch: ScratchBuffer,
    resident: usize,
    metrics: Arc<EngineMetrics>,
}

impl Handler {
    pub(crate) fn new(
        config: EngineConfig,
        uffd: Userfault,
        inbox: ControlInbox,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let poller = Poller::new(&uffd, inbox.doorbell(), config.poll_timeout_ms)?;
        Ok(Self {
            ring: EvictionRing::with_capacity(config.ring_capacity),
            scratch: ScratchBuffer::new(config.scratch_pages.max(1) * page_size()),
            index: RangeIndex::new(),
            objects: HashMap::new(),
            resident: 0,
            config,
            uffd,
            poller,
            inbox,
            metrics,
        })
    }

    /// Serve until shutdown or a fatal error, then tear everything down.
    pub(crate) fn run(mut self) -> Result<()> {
        info!(
            target: "faultline.engine",
            high = self.config.high_watermark,
            low = self.config.low_watermark,
            "fault handler started"
        );
        let result = self.serve();
        match &result {
            Ok(()) => info!(target: "faultline.engine", "fault handler stopping"),
            Err(e) => error!(target: "faultline.engine", error = %e, "fault handler failed"),
        }
        self.teardown(result.is_err());
        result
    }

    fn serve(&mut self) -> Result<()> {
        let mut interrupts = 0_u32;
        loop {
            let ready = match self.poller.wait()? {
                WaitOutcome::Ready(ready) => ready,
                WaitOutcome::TimedOut => {
                    interrupts = 0;
                    continue;
                }
                WaitOutcome::Interrupted => {
                    interrupts += 1;
                    if interrupts > self.config.max_poll_interrupts {
                        return Err(FaultError::resource("epoll_wait", Errno::EINTR));
                    }
                    continue;
                }
            };
            interrupts = 0;
            if ready.fault {
                self.drain_faults()?;
            }
            if ready.control {
                if let Flow::Stop = self.drain_control()? {
                    return Ok(());
                }
            }
        }
    }

    fn drain_faults(&mut self) -> Result<()> {
        while let Some(event) = self.uffd.read_event()? {
            match event {
                UserfaultEvent::PageFault { address } => self.resolve_fault(address)?,
                UserfaultEvent::Other(kind) => {
                    debug!(target: "faultline.fault", kind, "ignoring userfaultfd event");
                }
            }
        }
        Ok(())
    }

    fn drain_control(&mut self) -> Result<Flow> {
        self.inbox.doorbell().drain()?;
        while let Some(request) = self.inbox.try_next() {
            match request {
                Request::Allocate { id, config, reply } => {
                    let res = self.allocate(id, config);
                    answer(reply, res)?;
                }
                Request::Free { id, reply } => {
                    let res = self.free(id);
                    answer(reply, res)?;
                }
                Request::Reset { id, reply } => {
                    let res = self.reset(id);
                    answer(reply, res)?;
                }
                Request::Shutdown => {
                    info!(target: "faultline.engine", "shutdown requested");
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }

    // -----------------------------------------------------------------------
    // Object lifecycle
    // -----------------------------------------------------------------------

    fn allocate(&mut self, id: ObjectId, config: ObjectConfig) -> Result<Allocation> {
        let layout = config.layout();
        if layout.element_count > 0 {
            let chunk = layout.chunk(0).fill_len as usize;
            if chunk > self.config.high_watermark {
                return Err(FaultError::ChunkExceedsBudget {
                    chunk,
                    high: self.config.high_watermark,
                });
            }
        }
        let true_size = usize::try_from(layout.true_size())
            .map_err(|_| FaultError::invariant("object larger than the address space"))?;

        let region = MappedRegion::anonymous(true_size)?;
        let base = region.addr();
        self.uffd.register(base, true_size)?;
        let registration = Registration {
            uffd: &self.uffd,
            base,
            len: true_size,
            armed: true,
        };

        let header = layout.header_padded as usize;
        if header > 0 {
            self.uffd.zeropage(base, header)?;
        }
        let backing = if config.is_read_only() || layout.body_len == 0 {
            None
        } else {
            Some(BackingStore::create(&self.config.backing_dir, &layout)?)
        };
        self.index
            .insert(base, true_size, id)
            .map_err(|e| FaultError::invariant(format!("fresh mapping at {base:#x}: {e}")))?;
        registration.commit();

        info!(
            target: "faultline.object",
            %id,
            base,
            size = true_size,
            elements = layout.element_count,
            stride = layout.stride,
            chunk_elements = layout.objects_at_once,
            read_only = config.is_read_only(),
            "object allocated"
        );
        self.objects.insert(
            id,
            ObjectState {
                region,
                layout,
                config,
                backing,
            },
        );
        self.metrics.set_live_objects(self.objects.len());
        Ok(Allocation { base, true_size })
    }

    fn free(&mut self, id: ObjectId) -> Result<()> {
        let obj = self
            .objects
            .remove(&id)
            .ok_or(FaultError::UnknownObject { id: id.0 })?;
        let base = obj.region.addr();
        if let Err(e) = self.uffd.unregister(base, obj.region.len()) {
            warn!(target: "faultline.object", %id, error = %e, "unregister failed");
        }
        self.index
            .remove(base)
            .map_err(|_| FaultError::invariant(format!("{id} missing from the range index")))?;
        let released = tombstone_records(&mut self.ring, &mut self.resident, id)?;
        drop(obj);

        self.metrics.set_resident(self.resident);
        self.metrics.set_live_objects(self.objects.len());
        info!(target: "faultline.object", %id, base, released, "object freed");
        self.check_totals();
        Ok(())
    }

    fn reset(&mut self, id: ObjectId) -> Result<()> {
        if !self.objects.contains_key(&id) {
            return Err(FaultError::UnknownObject { id: id.0 });
        }
        let released = tombstone_records(&mut self.ring, &mut self.resident, id)?;
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or(FaultError::UnknownObject { id: id.0 })?;
        obj.region.release(
            obj.layout.header_padded as usize,
            obj.layout.body_reserved as usize,
        )?;
        let discarded = obj.backing.as_mut().map_or(0, |backing| {
            let saved = backing.dirty_count();
            backing.clear_dirty();
            saved
        });
        self.metrics.set_resident(self.resident);
        debug!(target: "faultline.object", %id, released, discarded, "object reset");
        self.check_totals();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    fn resolve_fault(&mut self, address: usize) -> Result<()> {
        EngineMetrics::bump(&self.metrics.faults);
        let entry = self
            .index
            .find_entry(address)
            .ok_or(FaultError::UnknownFaultAddress { address })?;
        let id = entry.owner;
        let layout = self
            .objects
            .get(&id)
            .map(|o| o.layout)
            .ok_or_else(|| FaultError::invariant(format!("{id} indexed but not tracked")))?;

        let header = layout.header_padded as usize;
        let offset = address - entry.base;
        if offset < header {
            trace!(target: "faultline.fault", %id, address, "header fault");
            return self.uffd.zeropage(address, page_size());
        }
        let span = layout.chunk_at((offset - header) as u64).ok_or_else(|| {
            FaultError::invariant(format!("fault at {address:#x} past the body of {id}"))
        })?;
        let fill = span.fill_len as usize;
        if fill > self.config.high_watermark {
            return Err(FaultError::ChunkExceedsBudget {
                chunk: fill,
                high: self.config.high_watermark,
            });
        }
        trace!(
            target: "faultline.fault",
            %id,
            address,
            chunk = span.index,
            start = span.start,
            end = span.end,
            "page fault"
        );

        self.ensure_free(fill)?;

        let obj = self
            .objects
            .get(&id)
            .ok_or_else(|| FaultError::invariant(format!("{id} vanished during eviction")))?;
        let buf = self.scratch.get(fill);
        let body_offset = span.body_offset as usize;
        let restored = match obj.backing.as_ref() {
            Some(b) if b.is_dirty(span.index)? => {
                buf.copy_from_slice(b.load(body_offset, fill)?);
                true
            }
            _ => {
                let data_len = span.data_len as usize;
                populate(&obj.config, &span, &mut buf[..data_len])?;
                buf[data_len..].fill(0);
                false
            }
        };
        if restored {
            EngineMetrics::bump(&self.metrics.restores);
            debug!(target: "faultline.evict", %id, chunk = span.index, "chunk restored from backing store");
        } else {
            EngineMetrics::bump(&self.metrics.populate_calls);
        }

        let fingerprint = Fingerprint::of(buf);
        let addr = entry.base + header + body_offset;
        self.ring
            .push(
                ChunkRecord {
                    addr,
                    len: fill,
                    fingerprint,
                    owner: id,
                    chunk: span.index,
                },
                true,
            )
            .map_err(|e| FaultError::invariant(format!("eviction ring: {e}")))?;
        self.resident += fill;
        self.metrics.set_resident(self.resident);

        match self.uffd.copy(addr, buf) {
            Ok(CopyOutcome::Installed) => {
                self.check_totals();
                Ok(())
            }
            Ok(CopyOutcome::AlreadyPresent) => {
                trace!(target: "faultline.fault", %id, chunk = span.index, "chunk already present");
                self.unrecord(addr)?;
                self.uffd.wake(addr, fill)
            }
            Err(e) => {
                self.unrecord(addr)?;
                Err(e)
            }
        }
    }

    /// Take back the record of a chunk whose copy did not install it.
    fn unrecord(&mut self, addr: usize) -> Result<()> {
        let record = self
            .ring
            .pop_newest()
            .filter(|r| r.addr == addr)
            .ok_or_else(|| FaultError::invariant(format!("newest record is not {addr:#x}")))?;
        self.resident = self
            .resident
            .checked_sub(record.len)
            .ok_or_else(|| FaultError::invariant("resident bytes underflow"))?;
        self.metrics.set_resident(self.resident);
        self.check_totals();
        Ok(())
    }

    /// Make room for `incoming` bytes.
    fn ensure_free(&mut self, incoming: usize) -> Result<()> {
        if self.resident + incoming <= self.config.high_watermark {
            return Ok(());
        }
        let before = self.resident;
        let mut reclaimed = 0_usize;
        while self.resident + incoming > self.config.low_watermark {
            let Some(record) = self.ring.pop() else {
                return Err(FaultError::BudgetExhausted {
                    needed: incoming,
                    resident: self.resident,
                    low: self.config.low_watermark,
                });
            };
            if record.len > 0 {
                self.reclaim(record)?;
                reclaimed += 1;
            }
        }
        debug!(
            target: "faultline.evict",
            before,
            after = self.resident,
            reclaimed,
            "eviction pass"
        );
        Ok(())
    }

    /// Release one live chunk, saving it first if it changed.
    fn reclaim(&mut self, record: ChunkRecord) -> Result<()> {
        let obj = self.objects.get_mut(&record.owner).ok_or_else(|| {
            FaultError::invariant(format!("live record for untracked {}", record.owner))
        })?;
        let offset = record
            .addr
            .checked_sub(obj.region.addr())
            .ok_or_else(|| FaultError::invariant("record below its object's base"))?;

        if let Some(backing) = obj.backing.as_mut() {
            // SAFETY: the record is live, so its pages are installed and
            // reading them cannot fault back into this thread.
            let current = unsafe { obj.region.bytes(offset, record.len) }?;
            if Fingerprint::of(current) != record.fingerprint {
                let body_offset = offset - obj.layout.header_padded as usize;
                backing.store(body_offset, current)?;
                backing.set_dirty(record.chunk)?;
                EngineMetrics::bump(&self.metrics.writebacks);
                debug!(
                    target: "faultline.evict",
                    id = %record.owner,
                    chunk = record.chunk,
                    "modified chunk written back"
                );
            }
        }

        obj.region.release(offset, record.len)?;
        self.resident = self
            .resident
            .checked_sub(record.len)
            .ok_or_else(|| FaultError::invariant("resident bytes underflow"))?;
        EngineMetrics::bump(&self.metrics.reclaims);
        self.metrics.set_resident(self.resident);
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn check_totals(&self) {
        let live: usize = self.ring.iter().map(|r| r.len).sum();
        debug_assert_eq!(live, self.resident, "ring records disagree with resident bytes");
        debug_assert!(
            self.resident <= self.config.high_watermark,
            "resident bytes above the high watermark"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn check_totals(&self) {}

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release everything: stop polling, unregister and unmap every object,
    /// answer every queued request, then close the control channel and the
    /// userfaultfd.
    ///
    /// After a failure a client thread may still be blocked on a fault.
    /// Unregistering wakes it to retry against plain anonymous memory, so
    /// the object mappings are then left in place for the rest of the
    /// process.
    fn teardown(self, failed: bool) {
        let Self {
            uffd,
            poller,
            inbox,
            mut index,
            mut objects,
            ring,
            metrics,
            ..
        } = self;
        drop(poller);

        let live = objects.len();
        index.drain().for_each(drop);
        for (id, obj) in objects.drain() {
            if let Err(e) = uffd.unregister(obj.region.addr(), obj.region.len()) {
                warn!(target: "faultline.object", %id, error = %e, "unregister failed during teardown");
            }
            if failed {
                obj.region.leak();
            }
        }
        drop(ring);
        metrics.set_resident(0);
        metrics.set_live_objects(0);

        let mut refused = 0_usize;
        while let Some(request) = inbox.try_next() {
            if !matches!(request, Request::Shutdown) {
                refused += 1;
            }
            request.refuse();
        }
        drop(inbox);
        drop(uffd);
        info!(target: "faultline.engine", live, refused, "fault handler stopped");
    }
}

/// Unregisters a range on drop unless committed.
struct Registration<'a> {
    uffd: &'a Userfault,
    base: usize,
    len: usize,
    armed: bool,
}

impl Registration<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.uffd.unregister(self.base, self.len) {
                warn!(target: "faultline.object", base = self.base, error = %e, "unwind unregister failed");
            }
        }
    }
}

/// Reply to a client. Fatal errors are reported to the client and also
/// returned so the handler stops.
fn answer<T>(reply: Reply<Result<T>>, res: Result<T>) -> Result<()> {
    match res {
        Err(e) if e.is_fatal() && !matches!(e, FaultError::ChunkExceedsBudget { .. }) => {
            reply.send(Err(e.clone()));
            Err(e)
        }
        other => {
            if let Err(e) = &other {
                warn!(target: "faultline.object", error = %e, "request failed");
            }
            reply.send(other);
            Ok(())
        }
    }
}

/// Tombstone every live record owned by `id`; returns how many.
fn tombstone_records(
    ring: &mut EvictionRing<ChunkRecord>,
    resident: &mut usize,
    id: ObjectId,
) -> Result<usize> {
    let mut released = 0_usize;
    let mut underflow = false;
    ring.for_each_mut(|r| {
        if r.owner == id && r.len > 0 {
            match resident.checked_sub(r.len) {
                Some(v) => *resident = v,
                None => underflow = true,
            }
            r.len = 0;
            released += 1;
        }
    });
    if underflow {
        return Err(FaultError::invariant("resident bytes underflow"));
    }
    Ok(released)
}

fn populate(config: &ObjectConfig, span: &ChunkSpan, out: &mut [u8]) -> Result<()> {
    let f = config
        .populate_fn()
        .ok_or(FaultError::MissingPopulateFunction)?;
    let req = PopulateRequest::new(span.start, span.end, config.stride(), config.user_data());
    match panic::catch_unwind(AssertUnwindSafe(|| f(&req, out))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FaultError::Populate {
            start: span.start,
            end: span.end,
            code: e.code,
        }),
        Err(_) => Err(FaultError::Populate {
            start: span.start,
            end: span.end,
            code: POPULATE_PANIC_CODE,
        }),
    }
}
