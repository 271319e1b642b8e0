//! Engine counters.
//!
//! Updated by the handler thread, read from any thread. All counters are
//! atomic so snapshots never take a lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Page-fault events resolved.
    pub faults: AtomicU64,
    /// Population callback invocations.
    pub populate_calls: AtomicU64,
    /// Chunks restored from a backing store instead of populated.
    pub restores: AtomicU64,
    /// Modified chunks written to a backing store on eviction.
    pub writebacks: AtomicU64,
    /// Chunks released by eviction.
    pub reclaims: AtomicU64,
    /// Bytes of populated, not yet evicted chunks.
    pub resident_bytes: AtomicU64,
    /// Highest `resident_bytes` seen.
    pub peak_resident_bytes: AtomicU64,
    /// Objects currently allocated.
    pub live_objects: AtomicU64,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish the handler's resident-byte count.
    pub(crate) fn set_resident(&self, bytes: usize) {
        let bytes = bytes as u64;
        self.resident_bytes.store(bytes, Ordering::Relaxed);
        self.peak_resident_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_live_objects(&self, n: usize) {
        self.live_objects.store(n as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            faults: self.faults.load(Ordering::Relaxed),
            populate_calls: self.populate_calls.load(Ordering::Relaxed),
            restores: self.restores.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            resident_bytes: self.resident_bytes.load(Ordering::Relaxed),
            peak_resident_bytes: self.peak_resident_bytes.load(Ordering::Relaxed),
            live_objects: self.live_objects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub faults: u64,
    pub populate_calls: u64,
    pub restores: u64,
    pub writebacks: u64,
    pub reclaims: u64,
    pub resident_bytes: u64,
    pub peak_resident_bytes: u64,
    pub live_objects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_maximum() {
        let m = EngineMetrics::new();
        m.set_resident(100);
        m.set_resident(400);
        m.set_resident(50);
        let s = m.snapshot();
        assert_eq!(s.resident_bytes, 50);
        assert_eq!(s.peak_resident_bytes, 400);
    }

    #[test]
    fn snapshot_serializes() {
        let m = EngineMetrics::new();
        EngineMetrics::bump(&m.faults);
        EngineMetrics::bump(&m.faults);
        EngineMetrics::bump(&m.populate_calls);
        m.set_live_objects(3);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"faults\":2"));
        assert!(json.contains("\"populate_calls\":1"));
        assert!(json.contains("\"live_objects\":3"));
    }
}
