//! Machine state and the per-frame poll context.
//!
//! A [`Machine`] owns the slab over one arena plus the user's poll function;
//! a [`Ctx`] threads the mutable per-frame state (program position, list
//! cache) through that poll function. Every core operation is reachable from
//! the context, which is also what binds allocations to the right machine.

use crate::config::ARENA_MAX_BYTES;
use crate::entry::Entry;
use crate::list::{List, ListCache};
use crate::ppoint::{self, PointRecord, Region};
use crate::reference::{self, Ref};
use crate::registry;
use crate::slab::{Slab, SlotFn};
use crate::stage;

/// The user's poll function, run once per frame.
pub type PollFn = fn(&mut Ctx);

/// One immediate-mode state machine: an arena of managed objects plus the
/// poll function that drives them.
pub struct Machine {
    /// Registry index; 0 until `init` runs.
    pub(crate) global_index: usize,
    pub(crate) slab: Slab,
    pub(crate) poll_fn: Option<PollFn>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub const fn new() -> Self {
        Self {
            global_index: 0,
            slab: Slab::new(),
            poll_fn: None,
        }
    }

    /// Binds the machine to its arena, registers it process-wide, and frees
    /// every slot through the regular release path.
    ///
    /// Arenas beyond the encodable size are clamped. Initializing a machine
    /// twice is fatal.
    ///
    /// # Safety
    ///
    /// `arena` must point to `arena_size` zero-initialized writable bytes,
    /// aligned for [`Entry`]. The machine and the arena must never move and
    /// must stay live for the rest of the process: encoded references keep
    /// the machine's address reachable through the process-wide registry.
    pub unsafe fn init(
        &mut self,
        arena: *mut u8,
        arena_size: usize,
        element_size: usize,
        init_fn: Option<SlotFn>,
        deinit_fn: Option<SlotFn>,
        poll_fn: PollFn,
    ) {
        assert!(
            self.poll_fn.is_none(),
            "machine must be initialized exactly once"
        );

        let mut arena_size = arena_size;
        if arena_size as u64 > ARENA_MAX_BYTES {
            log::warn!(
                "arena of {} bytes exceeds the encodable range, clamping to {}",
                arena_size,
                ARENA_MAX_BYTES
            );
            arena_size = ARENA_MAX_BYTES as usize;
        }

        self.poll_fn = Some(poll_fn);
        unsafe { self.slab.init(arena, arena_size, element_size, init_fn, deinit_fn) };
        self.global_index = registry::register(self);
    }

    /// The machine's registry index (non-zero once initialized).
    #[inline]
    pub fn global_index(&self) -> usize {
        self.global_index
    }

    #[inline]
    pub fn element_count(&self) -> usize {
        self.slab.element_count()
    }

    /// Test/debug introspection: the `i`-th slot's header iff active.
    #[inline]
    pub fn traverse(&self, i: usize) -> *mut Entry {
        self.slab.traverse(i)
    }

    /// Test/debug introspection: the active entry owning `ptr`, if any.
    #[inline]
    pub fn entry_of(&self, ptr: *const u8) -> *mut Entry {
        self.slab.entry_of(ptr)
    }

    #[inline]
    pub(crate) fn slab_base(&self) -> *mut u8 {
        self.slab.arena_base()
    }

    #[inline]
    pub(crate) fn slab_size(&self) -> usize {
        self.slab.arena_size()
    }

    /// Resolves an arena byte offset to its slot's header iff active.
    #[inline]
    pub(crate) fn slab_entry_at(&self, offset: usize) -> *mut Entry {
        self.slab.traverse(offset / self.slab.element_size())
    }
}

/// Mutable state a poll pass threads through its machine: the current
/// program position and the frame's list cache.
pub struct Ctx {
    pub(crate) machine: *mut Machine,
    pub(crate) position: PointRecord,
    pub(crate) cache: ListCache,
    /// Open region count; must return to zero by end of frame.
    pub(crate) region_depth: usize,
}

impl Ctx {
    /// Builds the context driving `machine`.
    ///
    /// # Safety
    ///
    /// `machine` must be initialized, must outlive the context, and must be
    /// driven from a single thread at a time.
    pub unsafe fn new(machine: *mut Machine) -> Ctx {
        Ctx {
            machine,
            position: PointRecord::initial(),
            cache: ListCache::new(),
            region_depth: 0,
        }
    }

    #[inline]
    pub(crate) fn machine_ptr(&self) -> *mut Machine {
        self.machine
    }

    #[inline]
    fn machine_mut(&mut self) -> &mut Machine {
        unsafe { &mut *self.machine }
    }

    #[inline]
    fn machine_ref(&self) -> &Machine {
        unsafe { &*self.machine }
    }

    /// Size of the bound machine's elements, in bytes.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.machine_ref().slab.element_size()
    }

    /// Draws a newly-activated entry, or null when the arena is exhausted.
    #[inline]
    pub fn get(&mut self) -> *mut Entry {
        self.machine_mut().slab.get()
    }

    /// Releases `entry` back to the machine. Null is a no-op; releasing a
    /// pointer outside this machine's arena is fatal.
    ///
    /// # Safety
    ///
    /// A non-null `entry` must be active and owned by the caller, which
    /// gives it up entirely.
    #[inline]
    pub unsafe fn put(&mut self, entry: *mut Entry) {
        unsafe { self.machine_mut().slab.put(entry) };
    }

    /// Bulk release of the first `n` slots of `list` (nulls skipped).
    ///
    /// # Safety
    ///
    /// Every non-null pointer in `list[..n]` must satisfy the [`Ctx::put`]
    /// contract.
    #[inline]
    pub unsafe fn put_n(&mut self, list: List, n: usize) {
        unsafe { self.machine_mut().slab.put_n(list, n) };
    }

    /// Encodes a reference to an interior pointer of an active entry, or the
    /// null reference if `ptr` does not resolve.
    #[inline]
    pub fn refer(&self, ptr: *const u8) -> Ref {
        reference::refer_in(self.machine_ref(), ptr)
    }

    /// Test/debug introspection over the bound machine.
    #[inline]
    pub fn entry_of(&self, ptr: *const u8) -> *mut Entry {
        self.machine_ref().entry_of(ptr)
    }

    /// State index for this visit; see [`crate::imsm_index!`].
    #[inline]
    pub fn index(&mut self, record: PointRecord) -> usize {
        ppoint::advance(&mut self.position, &record)
    }

    /// Opens a program region; the returned guard pops it when dropped.
    #[inline]
    pub fn region_push(&mut self, record: PointRecord) -> Region {
        Region::push(self, record)
    }

    /// Explicit pop for symmetry with `region_push`.
    #[inline]
    pub fn region_pop(&mut self, region: Region) {
        drop(region);
    }

    /// Runs `body` inside a region; the region pops on every exit path.
    pub fn with_region<R>(&mut self, record: PointRecord, body: impl FnOnce(&mut Ctx) -> R) -> R {
        let region = self.region_push(record);
        let ret = body(self);
        drop(region);
        ret
    }

    /// Stages `list_in` entries with matching aux into this call site's
    /// queue and returns the queue's wakeup-pending members; semantics in
    /// the `stage` module docs.
    #[inline]
    pub fn stage_io(&mut self, record: PointRecord, list_in: List, aux_match: u64) -> List {
        stage::stage_io(self, record, list_in, aux_match)
    }

    /// Fetches a frame-scoped list with room for `capacity` slots.
    #[inline]
    pub fn list_get(&mut self, capacity: usize) -> List {
        self.cache.get(capacity)
    }

    /// Retires a frame list before the end-of-frame recycle.
    #[inline]
    pub fn list_put(&mut self, list: List) {
        self.cache.put(list);
    }

    /// Recycles every frame list. All outstanding handles become invalid.
    #[inline]
    pub fn cache_recycle(&mut self) {
        self.cache.recycle();
    }

    /// Releases the list cache's buffers for good (also happens on drop).
    #[inline]
    pub fn cache_deinit(&mut self) {
        self.cache.deinit();
    }

    /// Restores the position for the next frame. The harness calls this at
    /// end of frame; custom frame loops do the same after `cache_recycle`.
    pub fn reset_position(&mut self) {
        debug_assert_eq!(self.region_depth, 0, "open region at end of frame");
        self.position = PointRecord::initial();
    }
}
