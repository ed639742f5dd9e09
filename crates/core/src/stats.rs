//! Lock-free global counters feeding the SIGQUIT diagnostics dump.
//!
//! Grounded on the teacher's `memory_stats.rs` per-thread slot registry and
//! `scheduler.rs`'s `ACTIVE_STRANDS`/`TOTAL_SPAWNED` atomics: single-VM
//! process (spec's non-goal rules out multi-threaded execution of one VM),
//! so a flat set of global atomics is sufficient — no per-thread slot table
//! is needed the way the teacher's multi-worker-thread runtime requires.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub static LIVE_FIBERS: AtomicUsize = AtomicUsize::new(0);
pub static TOTAL_FIBERS_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static OPEN_CHANNELS: AtomicUsize = AtomicUsize::new(0);
pub static HEAP_COLLECTIONS: AtomicU64 = AtomicU64::new(0);
pub static HEAP_LIVE_OBJECTS: AtomicUsize = AtomicUsize::new(0);

pub fn record_fiber_spawned() {
    LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
    TOTAL_FIBERS_SPAWNED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_fiber_completed() {
    LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
}

pub fn record_channel_opened() {
    OPEN_CHANNELS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_channel_closed() {
    OPEN_CHANNELS.fetch_sub(1, Ordering::Relaxed);
}

pub fn record_collection(stats: crate::heap::HeapStatsSnapshot) {
    HEAP_COLLECTIONS.store(stats.collections, Ordering::Relaxed);
    HEAP_LIVE_OBJECTS.store(stats.live_objects, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub live_fibers: usize,
    pub total_fibers_spawned: u64,
    pub open_channels: usize,
    pub heap_collections: u64,
    pub heap_live_objects: usize,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        live_fibers: LIVE_FIBERS.load(Ordering::Relaxed),
        total_fibers_spawned: TOTAL_FIBERS_SPAWNED.load(Ordering::Relaxed),
        open_channels: OPEN_CHANNELS.load(Ordering::Relaxed),
        heap_collections: HEAP_COLLECTIONS.load(Ordering::Relaxed),
        heap_live_objects: HEAP_LIVE_OBJECTS.load(Ordering::Relaxed),
    }
}
