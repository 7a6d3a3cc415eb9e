//! Process-wide machine registry.
//!
//! Encoded references carry a small machine index instead of a pointer; this
//! table maps the index back to the live machine. Slots are written once, at
//! machine init, and read-only afterward. Index 0 is reserved so an all-zero
//! reference stays null.
//!
//! Registration needs no lock: each caller claims a distinct index with one
//! compare-exchange on the cursor, and from then on owns its slot outright.
//! Lookups are plain acquire loads.

use crate::config::MAX_MACHINES;
use crate::machine::Machine;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Next index to hand out. Starts at 1, slot 0 stays null forever.
static NEXT_INDEX: AtomicUsize = AtomicUsize::new(1);

static SLOTS: [AtomicPtr<Machine>; MAX_MACHINES] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_MACHINES];

/// Registers a machine and returns its stable non-zero index.
///
/// Panics when the table is full; running out of machine slots means the
/// process configuration is wrong and no safe recovery exists.
pub(crate) fn register(machine: *mut Machine) -> usize {
    debug_assert!(!machine.is_null());

    let mut index = NEXT_INDEX.load(Ordering::Relaxed);
    loop {
        if index >= MAX_MACHINES {
            log::error!("machine registry exhausted ({} slots)", MAX_MACHINES);
            panic!("too many live machines");
        }
        match NEXT_INDEX.compare_exchange_weak(
            index,
            index + 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(current) => index = current,
        }
    }

    // The claimed slot is untouched since process start; the Release store
    // pairs with the Acquire in `lookup` so a decoder that sees the pointer
    // also sees the fully-initialized machine behind it.
    let previous = SLOTS[index].swap(machine, Ordering::Release);
    debug_assert!(previous.is_null(), "machine slots are write-once");

    log::debug!("registered machine {}", index);
    index
}

/// Maps an index back to its machine, or null for reserved, out-of-range,
/// or never-assigned indices.
#[inline]
pub(crate) fn lookup(index: usize) -> *mut Machine {
    if index == 0 || index >= MAX_MACHINES {
        return ptr::null_mut();
    }
    SLOTS[index].load(Ordering::Acquire)
}

/// Number of machines registered so far.
pub fn live_machines() -> usize {
    NEXT_INDEX.load(Ordering::Relaxed).min(MAX_MACHINES) - 1
}
