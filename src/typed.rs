//! Typed facade over the type-erased core.
//!
//! The core moves `*mut Entry` and `*mut u8` around; state structs are the
//! user's business. This module recovers type safety at the boundary: a
//! marker trait encoding the layout contract, a machine wrapper that derives
//! element sizes from the type, and a list wrapper casting in and out of the
//! frame lists.

use crate::entry::Entry;
use crate::list::List;
use crate::machine::{Ctx, Machine, PollFn};
use crate::ppoint::PointRecord;
use crate::slab::SlotFn;
use core::marker::PhantomData;

/// Marker for state structs managed by a machine.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with an [`Entry`] as their first field,
/// so a pointer to the struct is a pointer to its header and back.
pub unsafe trait EntryFirst: Sized {}

/// A machine managing elements of a concrete state type.
pub struct StateMachine<T: EntryFirst> {
    raw: Machine,
    _marker: PhantomData<fn(*mut T)>,
}

impl<T: EntryFirst> Default for StateMachine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: EntryFirst> StateMachine<T> {
    pub const fn new() -> Self {
        Self {
            raw: Machine::new(),
            _marker: PhantomData,
        }
    }

    /// Initializes the machine over an arena of `count` elements of `T`.
    ///
    /// # Safety
    ///
    /// `arena` must point to `count` zero-initialized `T` slots, and the
    /// [`Machine::init`] stability contract applies: neither the machine nor
    /// the arena may move or die for the rest of the process.
    pub unsafe fn init(
        &mut self,
        arena: *mut T,
        count: usize,
        init_fn: Option<SlotFn>,
        deinit_fn: Option<SlotFn>,
        poll_fn: PollFn,
    ) {
        const {
            assert!(
                core::mem::size_of::<T>() >= core::mem::size_of::<Entry>(),
                "state type must start with an Entry header"
            );
            assert!(core::mem::align_of::<T>() >= core::mem::align_of::<Entry>());
        }

        unsafe {
            self.raw.init(
                arena.cast(),
                count * core::mem::size_of::<T>(),
                core::mem::size_of::<T>(),
                init_fn,
                deinit_fn,
                poll_fn,
            );
        }
    }

    /// The underlying machine, e.g. for [`Driver::new`](crate::Driver::new).
    #[inline]
    pub fn raw(&mut self) -> *mut Machine {
        &mut self.raw
    }

    /// Typed introspection over slot `i`.
    #[inline]
    pub fn traverse(&self, i: usize) -> *mut T {
        self.raw.traverse(i).cast()
    }
}

/// Allocates a `T` from the context's machine, or null when exhausted.
#[inline]
pub fn get<T: EntryFirst>(ctx: &mut Ctx) -> *mut T {
    debug_assert_eq!(
        ctx.element_size(),
        core::mem::size_of::<T>(),
        "context machine does not manage this state type"
    );
    ctx.get().cast()
}

/// Releases a `T` back to the context's machine.
///
/// # Safety
///
/// Same contract as [`Ctx::put`].
#[inline]
pub unsafe fn put<T: EntryFirst>(ctx: &mut Ctx, state: *mut T) {
    debug_assert_eq!(ctx.element_size(), core::mem::size_of::<T>());
    unsafe { ctx.put(state.cast()) };
}

/// Bulk release of a typed frame list.
///
/// # Safety
///
/// Same contract as [`Ctx::put_n`].
#[inline]
pub unsafe fn put_n<T: EntryFirst>(ctx: &mut Ctx, list: TypedList<T>, n: usize) {
    unsafe { ctx.put_n(list.raw, n) };
}

/// Fetches a frame list whose slots are read as `*mut T`.
#[inline]
pub fn list_get<T: EntryFirst>(ctx: &mut Ctx, capacity: usize) -> TypedList<T> {
    TypedList::from_raw(ctx.list_get(capacity))
}

/// Typed staging: stages a `T` list and returns the pending `T`s.
///
/// Staged slots may be interior pointers; stage-out returns whatever was
/// staged, so the cast is only as honest as the staged pointers. Poll code
/// staging whole-struct pointers (the common case) round-trips exactly.
#[inline]
pub fn stage_io<T: EntryFirst>(
    ctx: &mut Ctx,
    record: PointRecord,
    list_in: TypedList<T>,
    aux_match: u64,
) -> TypedList<T> {
    TypedList::from_raw(ctx.stage_io(record, list_in.raw, aux_match))
}

/// A frame list carrying `*mut T`.
pub struct TypedList<T> {
    raw: List,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for TypedList<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedList<T> {}

impl<T: EntryFirst> TypedList<T> {
    pub const fn null() -> Self {
        Self::from_raw(List::null())
    }

    pub const fn from_raw(raw: List) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn raw(self) -> List {
        self.raw
    }

    #[inline]
    pub fn size(self) -> usize {
        self.raw.size()
    }

    #[inline]
    pub fn capacity(self) -> usize {
        self.raw.capacity()
    }

    #[inline]
    pub fn push(self, state: *mut T, aux: u64) -> bool {
        self.raw.push(state.cast(), aux)
    }

    #[inline]
    pub fn get(self, i: usize) -> *mut T {
        self.raw.ptr(i).cast()
    }

    #[inline]
    pub fn aux(self, i: usize) -> u64 {
        self.raw.aux(i)
    }

    /// Iterates the non-null slots.
    pub fn iter(self) -> impl Iterator<Item = *mut T> {
        self.raw.iter().map(|p| p.cast::<T>()).filter(|p| !p.is_null())
    }
}
