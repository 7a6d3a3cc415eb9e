//! Magazine slab allocator over a caller-supplied arena.
//!
//! The arena is carved into fixed-size slots, each starting with an
//! [`Entry`] header. Free slots circulate in magazines: the hot path serves
//! `get` from a draining magazine and `put` into a filling one, and full or
//! empty magazines move to intrusive backing stacks in O(1). No slot memory
//! ever leaves the arena, so object addresses are type-stable for the life
//! of the machine.

use crate::config::SLAB_MAGAZINE_SIZE;
use crate::entry::Entry;
use crate::stat_inc;
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use core::ptr;

/// Per-slot constructor/destructor; receives a pointer to the whole element.
pub type SlotFn = fn(*mut u8);

/// A fixed batch of slot pointers: the unit of transfer between the hot
/// caches and the backing stacks.
#[repr(C)]
struct Magazine {
    next: *mut Magazine,
    entries: [*mut Entry; SLAB_MAGAZINE_SIZE],
}

impl Magazine {
    fn allocate() -> *mut Magazine {
        let layout = Layout::new::<Magazine>();
        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            handle_alloc_error(layout);
        }
        raw.cast()
    }

    unsafe fn release(magazine: *mut Magazine) {
        unsafe { dealloc(magazine.cast(), Layout::new::<Magazine>()) };
    }
}

/// Free/allocated bookkeeping over one machine's arena.
pub struct Slab {
    arena: *mut u8,
    arena_size: usize,
    element_size: usize,
    element_count: usize,
    /// Allocation drains `current_allocating` downward; 0 means drained.
    current_alloc_index: usize,
    /// Deallocation fills `current_freeing` from -MAGAZINE_SIZE up to 0.
    current_free_index: isize,
    /// May be null when the arena is exhausted.
    current_allocating: *mut Magazine,
    /// Always valid and non-full outside of internal refresh steps.
    current_freeing: *mut Magazine,
    /// Intrusive stack of full magazines.
    freelist: *mut Magazine,
    /// Intrusive stack of empty magazines.
    empty: *mut Magazine,
    init_fn: Option<SlotFn>,
    deinit_fn: Option<SlotFn>,
}

impl Slab {
    pub(crate) const fn new() -> Self {
        Self {
            arena: ptr::null_mut(),
            arena_size: 0,
            element_size: 0,
            element_count: 0,
            current_alloc_index: 0,
            current_free_index: 0,
            current_allocating: ptr::null_mut(),
            current_freeing: ptr::null_mut(),
            freelist: ptr::null_mut(),
            empty: ptr::null_mut(),
            init_fn: None,
            deinit_fn: None,
        }
    }

    /// Takes ownership of `arena` and threads every slot through the free
    /// path, high index to low.
    ///
    /// # Safety
    ///
    /// `arena` must point to `arena_size` writable bytes, aligned for
    /// [`Entry`], zero-initialized, and must outlive the slab. The slab must
    /// be initialized exactly once.
    pub(crate) unsafe fn init(
        &mut self,
        arena: *mut u8,
        arena_size: usize,
        element_size: usize,
        init_fn: Option<SlotFn>,
        deinit_fn: Option<SlotFn>,
    ) {
        assert!(
            element_size >= core::mem::size_of::<Entry>(),
            "slab element type must embed an Entry header"
        );
        assert!(
            element_size % core::mem::align_of::<Entry>() == 0,
            "slab element size must keep every Entry header aligned"
        );
        debug_assert!(arena.cast::<Entry>().is_aligned());

        self.arena = arena;
        self.arena_size = arena_size;
        self.element_size = element_size;
        self.element_count = arena_size / element_size;
        self.init_fn = init_fn;
        self.deinit_fn = deinit_fn;
        self.init_freelist();

        log::debug!(
            "slab init: {} elements of {} bytes",
            self.element_count,
            self.element_size
        );
    }

    #[inline]
    pub(crate) fn arena_base(&self) -> *mut u8 {
        self.arena
    }

    #[inline]
    pub(crate) fn arena_size(&self) -> usize {
        self.arena_size
    }

    #[inline]
    pub(crate) fn element_size(&self) -> usize {
        self.element_size
    }

    #[inline]
    pub(crate) fn element_count(&self) -> usize {
        self.element_count
    }

    /// Draws a free slot and activates it. Returns null iff the arena is
    /// exhausted.
    ///
    /// The slot body is whatever the previous occupant's `deinit_fn` left
    /// behind (or fresh zeroes on first use); the caller re-initializes the
    /// fields it cares about.
    #[inline]
    pub(crate) fn get(&mut self) -> *mut Entry {
        if self.current_allocating.is_null() {
            return self.get_slow();
        }

        stat_inc!(slab_gets);
        let alloc_index = self.current_alloc_index - 1;
        self.current_alloc_index = alloc_index;
        let ret = unsafe { (*self.current_allocating).entries[alloc_index] };
        unsafe { (*ret).activate() };
        if alloc_index == 0 {
            self.get_cache_reload();
        }

        ret
    }

    #[cold]
    fn get_slow(&mut self) -> *mut Entry {
        if self.current_allocating.is_null() {
            self.get_cache_reload();
        }
        if self.current_allocating.is_null() {
            return ptr::null_mut();
        }

        // get only lands here when current_allocating was absent.
        self.get()
    }

    /// Runs `deinit_fn`, retires the entry, and returns its slot to the
    /// freeing cache. Null is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `freed` must be an active entry of this slab's arena, and
    /// the caller must not touch it afterward.
    #[inline]
    pub(crate) unsafe fn put(&mut self, freed: *mut Entry) {
        if freed.is_null() {
            return;
        }
        assert!(
            self.contains(freed.cast()),
            "released entry must belong to this machine's arena"
        );
        debug_assert_eq!(
            (freed as usize - self.arena as usize) % self.element_size,
            0,
            "released pointer must be a slot head, not an interior pointer"
        );

        stat_inc!(slab_puts);
        // Keep this sequence in sync with put_n.
        if let Some(deinit_fn) = self.deinit_fn {
            deinit_fn(freed.cast());
        }
        unsafe { (*freed).retire() };
        self.add_free(freed);
    }

    /// Bulk release: `put` semantics for the first `n` slots of `list`,
    /// skipping nulls and clearing consumed slots.
    ///
    /// # Safety
    ///
    /// Every non-null pointer in `list[..n]` must satisfy the `put`
    /// contract.
    pub(crate) unsafe fn put_n(&mut self, list: crate::list::List, n: usize) {
        debug_assert!(n <= list.size());

        for i in 0..n {
            let freed: *mut Entry = list.ptr(i).cast();
            list.set_ptr(i, ptr::null_mut());
            unsafe { self.put(freed) };
        }
    }

    /// Returns the entry header owning `ptr`, or null when `ptr` is outside
    /// the arena or the slot is inactive.
    #[inline]
    pub(crate) fn entry_of(&self, ptr: *const u8) -> *mut Entry {
        let offset = (ptr as usize).wrapping_sub(self.arena as usize);
        if offset >= self.arena_size {
            return ptr::null_mut();
        }

        self.traverse(offset / self.element_size)
    }

    /// Returns the `i`-th slot's header iff that slot is active.
    #[inline]
    pub(crate) fn traverse(&self, i: usize) -> *mut Entry {
        if i >= self.element_count {
            return ptr::null_mut();
        }

        let entry = unsafe { self.arena.add(i * self.element_size) }.cast::<Entry>();
        if unsafe { (*entry).is_active() } { entry } else { ptr::null_mut() }
    }

    #[inline]
    fn contains(&self, ptr: *const u8) -> bool {
        (ptr as usize).wrapping_sub(self.arena as usize) < self.arena_size
    }

    fn get_empty_magazine(&mut self) -> *mut Magazine {
        let ret = self.empty;
        if !ret.is_null() {
            self.empty = unsafe { (*ret).next };
            return ret;
        }

        Magazine::allocate()
    }

    fn get_full_magazine(&mut self) -> *mut Magazine {
        let ret = self.freelist;
        if !ret.is_null() {
            self.freelist = unsafe { (*ret).next };
        }
        ret
    }

    fn refresh_current_freeing(&mut self) {
        debug_assert!(self.current_freeing.is_null());

        self.current_freeing = self.get_empty_magazine();
        self.current_free_index = -(SLAB_MAGAZINE_SIZE as isize);
    }

    /// Steals the populated part of the freeing cache as the new allocation
    /// cache.
    ///
    /// This edge path is what lets arenas with capacity below two magazines
    /// still allocate: without it, freed slots could sit forever in a
    /// never-full freeing magazine.
    fn convert_freeing_to_allocating(&mut self) {
        let num_freed = (SLAB_MAGAZINE_SIZE as isize + self.current_free_index) as usize;

        debug_assert!(
            !self.current_freeing.is_null(),
            "current_freeing must always be valid and never full"
        );
        debug_assert!(self.current_free_index >= -(SLAB_MAGAZINE_SIZE as isize));

        if num_freed == 0 {
            self.current_alloc_index = 0;
            self.current_allocating = ptr::null_mut();
            return;
        }

        let stolen = self.current_freeing;
        self.current_freeing = ptr::null_mut();
        self.refresh_current_freeing();

        // The freeing cache fills entries[0..num_freed] in push order, which
        // is exactly the layout the draining side expects.
        self.current_allocating = stolen;
        self.current_alloc_index = num_freed;
    }

    fn refresh_current_allocating(&mut self) {
        debug_assert!(self.current_allocating.is_null());

        let full = self.get_full_magazine();
        if full.is_null() {
            self.convert_freeing_to_allocating();
            return;
        }

        self.current_allocating = full;
        self.current_alloc_index = SLAB_MAGAZINE_SIZE;
    }

    /// Pushes the now-full freeing magazine onto the freelist and installs a
    /// fresh empty one.
    fn flush(&mut self) {
        debug_assert!(
            self.current_free_index == 0,
            "flush must only run on full magazines"
        );

        stat_inc!(magazine_flushes);
        let full = self.current_freeing;
        unsafe { (*full).next = self.freelist };
        self.freelist = full;

        self.current_freeing = ptr::null_mut();
        self.refresh_current_freeing();
    }

    fn get_cache_reload(&mut self) {
        debug_assert!(
            self.current_alloc_index == 0,
            "only drained allocation caches may be reloaded"
        );

        stat_inc!(cache_reloads);
        if !self.current_allocating.is_null() {
            let drained = self.current_allocating;
            unsafe { (*drained).next = self.empty };
            self.empty = drained;
            self.current_allocating = ptr::null_mut();
        }

        self.refresh_current_allocating();
    }

    #[inline]
    fn add_free(&mut self, entry: *mut Entry) {
        let free_index = self.current_free_index + 1;
        self.current_free_index = free_index;
        let slot = (SLAB_MAGAZINE_SIZE as isize - 1 + free_index) as usize;
        unsafe { (*self.current_freeing).entries[slot] = entry };
        if free_index == 0 {
            self.flush();
        }
    }

    fn init_freelist(&mut self) {
        self.refresh_current_freeing();
        for i in (0..self.element_count).rev() {
            let to_free = unsafe { self.arena.add(i * self.element_size) }.cast::<Entry>();
            unsafe { to_free.write(Entry::free()) };
            if let Some(init_fn) = self.init_fn {
                init_fn(to_free.cast());
            }
            self.add_free(to_free);
        }

        // Confirm that we set up a valid slab.
        debug_assert_eq!(self.current_alloc_index, 0);
        debug_assert!(
            self.current_free_index < 0
                && self.current_free_index >= -(SLAB_MAGAZINE_SIZE as isize)
        );
        debug_assert!(self.current_allocating.is_null());
        debug_assert!(!self.current_freeing.is_null());
        debug_assert!(self.empty.is_null());
    }

    fn release_stack(mut head: *mut Magazine) {
        while !head.is_null() {
            let next = unsafe { (*head).next };
            unsafe { Magazine::release(head) };
            head = next;
        }
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // Magazines are the slab's only heap allocations; slot memory
        // belongs to the caller.
        if !self.current_allocating.is_null() {
            unsafe { Magazine::release(self.current_allocating) };
        }
        if !self.current_freeing.is_null() {
            unsafe { Magazine::release(self.current_freeing) };
        }
        Self::release_stack(self.freelist);
        Self::release_stack(self.empty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    const ELSIZE: usize = 32;

    fn make_slab(slots: usize) -> Slab {
        let layout = Layout::from_size_align(slots.max(1) * ELSIZE, 8).unwrap();
        let arena = unsafe { alloc_zeroed(layout) };
        assert!(!arena.is_null());

        let mut slab = Slab::new();
        unsafe { slab.init(arena, slots * ELSIZE, ELSIZE, None, None) };
        slab
    }

    #[test]
    fn test_round_trip_preserves_pointer_set() {
        let mut slab = make_slab(64);

        let mut got: Vec<*mut Entry> = (0..64).map(|_| slab.get()).collect();
        assert!(got.iter().all(|p| !p.is_null()));

        // All distinct, all in the arena.
        let mut sorted = got.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 64);
        let base = slab.arena_base() as usize;
        for &p in &got {
            let off = p as usize - base;
            assert!(off < slab.arena_size());
            assert_eq!(off % ELSIZE, 0);
        }

        for p in got.drain(..) {
            unsafe { slab.put(p) };
        }

        // The same pointers come back, in some order.
        let again: Vec<*mut Entry> = (0..64).map(|_| slab.get()).collect();
        let mut again_sorted = again.clone();
        again_sorted.sort();
        again_sorted.dedup();
        assert_eq!(again_sorted, sorted);
    }

    #[test]
    fn test_capacity_saturation() {
        const N: usize = 40;
        let mut slab = make_slab(N);

        for _ in 0..N {
            assert!(!slab.get().is_null());
        }
        assert!(slab.get().is_null());
        assert!(slab.get().is_null());
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let mut slab = make_slab(2);

        let p0 = slab.get();
        let p1 = slab.get();
        assert!(!p0.is_null() && !p1.is_null());
        assert!(slab.get().is_null());

        unsafe { slab.put(p1) };
        assert_eq!(slab.get(), p1);

        unsafe { slab.put(p1) };
        unsafe { slab.put(p0) };
        assert!(!slab.get().is_null());
        assert!(!slab.get().is_null());
        assert!(slab.get().is_null());
    }

    #[test]
    fn test_small_arena_never_starves() {
        // Fewer slots than two magazines: the freeing-to-allocating
        // conversion must keep allocation alive indefinitely.
        let mut slab = make_slab(3);

        let mut held = slab.get();
        assert!(!held.is_null());
        for _ in 0..100 {
            let next = slab.get();
            assert!(!next.is_null());
            unsafe { slab.put(held) };
            held = next;
        }
    }

    #[test]
    fn test_generation_strictly_increases_per_slot() {
        let mut slab = make_slab(4);

        let p = slab.get();
        let g0 = unsafe { (*p).generation() };
        assert_eq!(g0 & 1, 1);

        unsafe { slab.put(p) };
        // Same slot comes back from the freeing cache via conversion.
        let mut seen = g0;
        for _ in 0..20 {
            let q = slab.get();
            let g = unsafe { (*q).generation() };
            if q == p {
                assert!(g > seen);
                assert_eq!(g & 1, 1);
                seen = g;
            }
            unsafe { slab.put(q) };
        }
    }

    #[test]
    fn test_put_null_is_noop() {
        let mut slab = make_slab(2);
        unsafe { slab.put(ptr::null_mut()) };
        assert!(!slab.get().is_null());
    }

    #[test]
    fn test_traverse_only_sees_active() {
        let mut slab = make_slab(8);
        for i in 0..8 {
            assert!(slab.traverse(i).is_null());
        }
        assert!(slab.traverse(8).is_null());

        let p = slab.get();
        let base = slab.arena_base() as usize;
        let idx = (p as usize - base) / ELSIZE;
        assert_eq!(slab.traverse(idx), p);

        unsafe { slab.put(p) };
        assert!(slab.traverse(idx).is_null());
    }

    #[test]
    fn test_entry_of_interior_pointers() {
        let mut slab = make_slab(8);
        let p = slab.get();

        let interior = unsafe { p.cast::<u8>().add(ELSIZE - 1) };
        assert_eq!(slab.entry_of(interior), p);
        // One past the slot resolves to the next slot (inactive => null).
        let beyond = unsafe { p.cast::<u8>().add(ELSIZE) };
        assert!(slab.entry_of(beyond).is_null());
        // Way outside the arena.
        assert!(slab.entry_of(usize::MAX as *const u8).is_null());
    }

    #[test]
    fn test_deinit_runs_on_put() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static DEINITS: AtomicUsize = AtomicUsize::new(0);

        fn count_deinit(_slot: *mut u8) {
            DEINITS.fetch_add(1, Ordering::Relaxed);
        }

        let layout = Layout::from_size_align(4 * ELSIZE, 8).unwrap();
        let arena = unsafe { alloc_zeroed(layout) };
        let mut slab = Slab::new();
        unsafe { slab.init(arena, 4 * ELSIZE, ELSIZE, None, Some(count_deinit)) };

        let before = DEINITS.load(Ordering::Relaxed);
        let p = slab.get();
        unsafe { slab.put(p) };
        assert_eq!(DEINITS.load(Ordering::Relaxed), before + 1);
    }
}
