//! Operation counters behind the `stats` feature.
//!
//! The counters answer tuning questions about a running machine: how often
//! allocation leaves the magazine fast path, how much a frame stages in and
//! drains out, what fraction of external notifications actually land on a
//! live entry. They are process-global (machines on different threads share
//! one set), so the cells are `Relaxed` atomics; nothing in the core ever
//! reads them back to make decisions. Take a [`Snapshot`] between frames
//! and diff two of them to get per-interval rates.

use core::sync::atomic::{AtomicU64, Ordering};

#[doc(hidden)]
pub struct Stats {
    /// Successful fast or slow path slab allocations.
    pub slab_gets: AtomicU64,
    /// Entries released back to a slab (bulk releases count each entry).
    pub slab_puts: AtomicU64,
    /// Full freeing magazines pushed to a freelist.
    pub magazine_flushes: AtomicU64,
    /// Allocation-cache reloads, including freeing-cache conversions.
    pub cache_reloads: AtomicU64,
    /// Calls to the staging operator.
    pub stage_calls: AtomicU64,
    /// Entries moved into a queue by staging.
    pub stage_ins: AtomicU64,
    /// Pending entries returned by staging sweeps.
    pub stage_outs: AtomicU64,
    /// External notifications that reached a live entry.
    pub notifications: AtomicU64,
    /// Frames driven by the poll harness.
    pub frames: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            slab_gets: AtomicU64::new(0),
            slab_puts: AtomicU64::new(0),
            magazine_flushes: AtomicU64::new(0),
            cache_reloads: AtomicU64::new(0),
            stage_calls: AtomicU64::new(0),
            stage_ins: AtomicU64::new(0),
            stage_outs: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        }
    }
}

#[doc(hidden)]
pub static STATS: Stats = Stats::new();

/// Plain-integer copy of every counter at one read point.
///
/// Counters keep ticking while the copy is taken, so fields read during a
/// concurrent frame may be mutually torn; the numbers are meant to be
/// diffed over time, where that wash-out does not matter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Successful slab allocations.
    pub slab_gets: u64,
    /// Entries released back to a slab.
    pub slab_puts: u64,
    /// Full freeing magazines pushed to a freelist.
    pub magazine_flushes: u64,
    /// Allocation-cache reloads.
    pub cache_reloads: u64,
    /// Calls to the staging operator.
    pub stage_calls: u64,
    /// Entries moved into a queue by staging.
    pub stage_ins: u64,
    /// Pending entries returned by staging sweeps.
    pub stage_outs: u64,
    /// External notifications that reached a live entry.
    pub notifications: u64,
    /// Frames driven by the poll harness.
    pub frames: u64,
}

/// Copies the current counter values into a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        slab_gets: s.slab_gets.load(Ordering::Relaxed),
        slab_puts: s.slab_puts.load(Ordering::Relaxed),
        magazine_flushes: s.magazine_flushes.load(Ordering::Relaxed),
        cache_reloads: s.cache_reloads.load(Ordering::Relaxed),
        stage_calls: s.stage_calls.load(Ordering::Relaxed),
        stage_ins: s.stage_ins.load(Ordering::Relaxed),
        stage_outs: s.stage_outs.load(Ordering::Relaxed),
        notifications: s.notifications.load(Ordering::Relaxed),
        frames: s.frames.load(Ordering::Relaxed),
    }
}
