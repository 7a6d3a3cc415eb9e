//! Encoded references: 64-bit handles that survive free safely.
//!
//! A reference packs (machine index, arena byte offset, generation tag) and
//! multiplies the bag by a fixed odd constant; decoding multiplies by the
//! modular inverse. The multiply is not a security measure; it is a cheap
//! self-check that turns arithmetic on raw bits, stale cookies, and most
//! single-bit corruption into a decode that fails the generation tag, so
//! use-after-free degrades to a null dereference and external event sources
//! may hand us arbitrary 64-bit values.
//!
//! All-zero bits are the null reference.

use crate::config::{
    ENCODER_MULTIPLIER, GENERATION_TAG_BITS, MACHINE_INDEX_BITS, MAX_MACHINES, OFFSET_FIELD_BITS,
};
use crate::entry::Entry;
use crate::machine::Machine;
use crate::registry;
use crate::stat_inc;
use core::ptr;
use static_assertions::const_assert;

/// Inverse of an odd multiplier mod 2^64 by Newton iteration; each step
/// doubles the number of correct low bits.
const fn modular_inverse(a: u64) -> u64 {
    let mut x = a.wrapping_mul(3) ^ 2; // correct to 5 bits
    let mut i = 0;
    while i < 4 {
        x = x.wrapping_mul(2u64.wrapping_sub(a.wrapping_mul(x)));
        i += 1;
    }
    x
}

const DECODER_MULTIPLIER: u64 = modular_inverse(ENCODER_MULTIPLIER);

const_assert!(ENCODER_MULTIPLIER & 1 == 1);
const_assert!(ENCODER_MULTIPLIER.wrapping_mul(DECODER_MULTIPLIER) == 1);
const_assert!(MACHINE_INDEX_BITS + OFFSET_FIELD_BITS + GENERATION_TAG_BITS == 64);
const_assert!(MAX_MACHINES <= 1 << MACHINE_INDEX_BITS);

const OFFSET_MASK: u64 = (1 << OFFSET_FIELD_BITS) - 1;
const TAG_MASK: u64 = (1 << GENERATION_TAG_BITS) - 1;

/// A packed, obfuscated handle to a machine-managed object.
///
/// References are plain data: copy them, hand them to an event multiplexer
/// as a 64-bit cookie, get them back frames later. Dereferencing checks the
/// machine, the offset, and the generation tag, so a reference to a
/// since-freed object resolves to null rather than to its reused slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Ref {
    bits: u64,
}

impl Ref {
    /// The null reference.
    pub const NULL: Ref = Ref { bits: 0 };

    /// Reconstitutes a reference from a raw cookie. Any value is accepted;
    /// corrupt ones simply fail to dereference.
    #[inline]
    pub const fn from_bits(bits: u64) -> Ref {
        Ref { bits }
    }

    /// The raw cookie to hand to an external notifier.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.bits == 0
    }
}

struct Decoded {
    machine_index: usize,
    offset: usize,
    tag: u64,
}

#[inline]
fn pack(machine_index: u64, offset: u64, tag: u64) -> u64 {
    debug_assert!(machine_index < (1 << MACHINE_INDEX_BITS));
    debug_assert!(offset <= OFFSET_MASK);
    debug_assert!(tag <= TAG_MASK);

    let fields = (machine_index << (OFFSET_FIELD_BITS + GENERATION_TAG_BITS))
        | (offset << GENERATION_TAG_BITS)
        | tag;
    fields.wrapping_mul(ENCODER_MULTIPLIER)
}

#[inline]
fn unpack(bits: u64) -> Decoded {
    let fields = bits.wrapping_mul(DECODER_MULTIPLIER);
    Decoded {
        machine_index: (fields >> (OFFSET_FIELD_BITS + GENERATION_TAG_BITS)) as usize,
        offset: ((fields >> GENERATION_TAG_BITS) & OFFSET_MASK) as usize,
        tag: fields & TAG_MASK,
    }
}

/// Encodes a reference to `ptr`, an interior pointer of an active entry of
/// `machine`'s arena. Returns the null reference when `ptr` does not resolve.
pub(crate) fn refer_in(machine: &Machine, ptr: *const u8) -> Ref {
    let entry = machine.entry_of(ptr);
    if entry.is_null() {
        return Ref::NULL;
    }

    debug_assert_ne!(machine.global_index(), 0, "machine must be registered");
    let offset = ptr as usize - machine.slab_base() as usize;
    let tag = unsafe { (*entry).generation_tag() };
    Ref::from_bits(pack(machine.global_index() as u64, offset as u64, tag))
}

enum Resolution {
    /// The cookie cannot have been produced by `refer_in`.
    Corrupt,
    /// Shape is plausible but the slot moved on; stale wake-ups are dropped.
    Stale,
    Live(*mut Entry),
}

fn resolve(decoded: &Decoded) -> Resolution {
    let machine = registry::lookup(decoded.machine_index);
    if machine.is_null() {
        return Resolution::Corrupt;
    }

    let machine = unsafe { &*machine };
    if decoded.offset >= machine.slab_size() {
        return Resolution::Corrupt;
    }

    let entry = machine.slab_entry_at(decoded.offset);
    if entry.is_null() {
        return Resolution::Stale;
    }
    if unsafe { (*entry).generation_tag() } != decoded.tag {
        return Resolution::Stale;
    }

    Resolution::Live(entry)
}

/// Returns the entry header a reference resolves to, or null for the null
/// reference and for any stale or corrupt value.
pub fn deref(r: Ref) -> *mut Entry {
    if r.is_null() {
        return ptr::null_mut();
    }

    match resolve(&unpack(r.bits)) {
        Resolution::Live(entry) => entry,
        _ => ptr::null_mut(),
    }
}

/// Returns the machine a reference points into, or null.
pub fn deref_machine(r: Ref) -> *mut Machine {
    if r.is_null() {
        return ptr::null_mut();
    }

    registry::lookup(unpack(r.bits).machine_index)
}

/// Marks the referenced entry wakeup-pending, if it is still live.
///
/// This is the only operation crossing from external signal sources into
/// the core; it tolerates arbitrary 64-bit cookies. Returns `true` for the
/// null reference and for plausibly-stale ones (a spurious or missed wake-up
/// is allowed), `false` for definitely-corrupt values.
pub fn notify(r: Ref) -> bool {
    if r.is_null() {
        return true;
    }

    match resolve(&unpack(r.bits)) {
        Resolution::Corrupt => false,
        Resolution::Stale => true,
        Resolution::Live(entry) => {
            stat_inc!(notifications);
            unsafe { (*entry).wakeup_pending = 1 };
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Ctx;
    use crate::machine::tests::leak_machine;

    const ELSIZE: usize = 48;

    #[test]
    fn test_refer_deref_round_trip() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { Ctx::new(machine) };

        let entry = ctx.get();
        assert!(!entry.is_null());
        let r = ctx.refer(entry.cast());
        assert!(!r.is_null());
        assert_eq!(deref(r), entry);
        assert_eq!(deref_machine(r), machine);
    }

    #[test]
    fn test_interior_pointer_resolves_to_header() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { Ctx::new(machine) };

        let entry = ctx.get();
        let interior = unsafe { entry.cast::<u8>().add(24) };
        let r = ctx.refer(interior);
        assert!(!r.is_null());
        assert_eq!(deref(r), entry);
    }

    #[test]
    fn test_deref_null_and_freed() {
        let machine = leak_machine(4, ELSIZE);
        let mut ctx = unsafe { Ctx::new(machine) };

        assert!(deref(Ref::NULL).is_null());

        let entry = ctx.get();
        let r = ctx.refer(entry.cast());
        unsafe { ctx.put(entry) };
        assert!(deref(r).is_null());

        // Drain until the slot is reused: the old reference must not revive.
        let mut again = core::ptr::null_mut();
        for _ in 0..4 {
            again = ctx.get();
            if again == entry {
                break;
            }
        }
        assert_eq!(again, entry);
        assert!(deref(r).is_null());
        let fresh = ctx.refer(again.cast());
        assert_ne!(fresh, r);
        assert_eq!(deref(fresh), again);
    }

    #[test]
    fn test_refer_rejects_foreign_and_inactive() {
        let machine = leak_machine(4, ELSIZE);
        let ctx = unsafe { Ctx::new(machine) };

        let mut outside = 0u64;
        let r = ctx.refer((&mut outside as *mut u64).cast());
        assert!(r.is_null());
    }

    #[test]
    fn test_single_bit_corruption_rejected() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { Ctx::new(machine) };

        let entry = ctx.get();
        let r = ctx.refer(entry.cast());

        let mut survivors = 0;
        for bit in 0..64 {
            let corrupt = Ref::from_bits(r.bits() ^ (1u64 << bit));
            if deref(corrupt) == entry {
                survivors += 1;
            }
        }
        // The multiply spreads any flipped bit across the fields; the tag
        // check then rejects essentially all of them.
        assert_eq!(survivors, 0);
    }

    #[test]
    fn test_notify_tolerates_adversarial_cookies() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { Ctx::new(machine) };
        let live = ctx.get();
        let live_ref = ctx.refer(live.cast());

        // Deterministic 64-bit LCG; no cookie may crash or corrupt memory.
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..100_000 {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let _ = notify(Ref::from_bits(state));
        }

        // The live entry is still intact and reachable.
        assert_eq!(deref(live_ref), live);
        assert!(notify(Ref::NULL));
        assert!(notify(live_ref));
        assert_ne!(unsafe { (*live).wakeup_pending }, 0);
    }

    #[test]
    fn test_notify_distinguishes_corrupt_from_stale() {
        let machine = leak_machine(4, ELSIZE);
        let mut ctx = unsafe { Ctx::new(machine) };

        let entry = ctx.get();
        let r = ctx.refer(entry.cast());
        unsafe { ctx.put(entry) };

        // Stale but well-formed: accepted, silently dropped.
        assert!(notify(r));
        // Machine index 0 can never be produced by refer_in.
        let corrupt = Ref::from_bits(pack(0, 8, 1));
        assert!(!notify(corrupt));
    }
}
