//! The staging operator: queueing keyed by program point.
//!
//! `stage_io` is the primitive the other tiers compose into. Called once per
//! program point per frame, it files the incoming entries under that point's
//! queue and returns every member of the queue with a pending wake-up, in
//! arena order. Because the queue id is re-derived from the program position
//! each frame, moving an object between pipeline stages is just staging it
//! at a different call site.

use crate::entry::QUEUE_NONE;
use crate::list::List;
use crate::machine::Ctx;
use crate::ppoint::PointRecord;
use crate::stat_inc;

/// Stages `list_in` into the queue of this call site and drains the queue's
/// pending members.
///
/// Stage-in takes the non-null slots of `list_in` whose aux value equals
/// `aux_match`; each is filed under the queue and re-armed. Pointers that do
/// not resolve to a live arena entry are skipped. Interior pointers more
/// than 255 bytes past their header are a fatal contract violation, as is
/// exhausting the 16-bit queue-id space.
///
/// Stage-out returns a fresh frame list holding `header + staged offset` for
/// every live queue member whose wake-up was pending, clearing the flag.
pub(crate) fn stage_io(ctx: &mut Ctx, record: PointRecord, list_in: List, aux_match: u64) -> List {
    let queue = ctx.index(record);
    assert!(
        queue < usize::from(QUEUE_NONE),
        "program-point queue space exhausted"
    );
    stat_inc!(stage_calls);

    let machine = ctx.machine_ptr();
    let slab = unsafe { &mut (*machine).slab };

    for i in 0..list_in.size() {
        let ptr = list_in.ptr(i);
        if ptr.is_null() || list_in.aux(i) != aux_match {
            continue;
        }

        let header = slab.entry_of(ptr);
        if header.is_null() {
            continue;
        }

        let offset = ptr as usize - header as usize;
        assert!(
            offset <= usize::from(u8::MAX),
            "staged interior pointer must lie within 255 bytes of its header"
        );

        stat_inc!(stage_ins);
        unsafe {
            (*header).queue_id = queue as u16;
            (*header).offset = offset as u8;
            (*header).wakeup_pending = 1;
        }
    }

    let element_count = slab.element_count();
    let list_out = ctx.cache.get(element_count);
    for i in 0..element_count {
        let header = slab.traverse(i);
        if header.is_null() {
            continue;
        }

        let woken = unsafe {
            (*header).queue_id == queue as u16 && (*header).wakeup_pending != 0
        };
        if !woken {
            continue;
        }

        stat_inc!(stage_outs);
        unsafe {
            (*header).wakeup_pending = 0;
            let interior = header.cast::<u8>().add(usize::from((*header).offset));
            let pushed = list_out.push(interior, 0);
            debug_assert!(pushed, "stage-out list sized to the arena");
        }
    }

    list_out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::tests::leak_machine;
    use crate::reference;
    use crate::{point_record, program_point};
    use alloc::vec::Vec;

    const ELSIZE: usize = 64;

    fn staged_ptrs(list: List) -> Vec<*mut u8> {
        list.iter().collect()
    }

    #[test]
    fn test_stage_round_trip() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { crate::machine::Ctx::new(machine) };

        let e1 = ctx.get();
        let e2 = ctx.get();
        let input = ctx.list_get(2);
        input.push(e1.cast(), 0);
        input.push(e2.cast(), 0);

        let point = program_point!("round_trip");
        let out = ctx.stage_io(PointRecord::new(point, 0), input, 0);

        // Arena order equals allocation order here: init frees high to low,
        // so the drain hands out slot 0 first.
        assert_eq!(staged_ptrs(out), alloc::vec![e1.cast::<u8>(), e2.cast()]);

        // Next frame: nothing pending until someone notifies.
        ctx.cache_recycle();
        ctx.reset_position();
        let empty = ctx.list_get(0);
        let out = ctx.stage_io(PointRecord::new(point, 0), empty, 0);
        assert_eq!(out.size(), 0);

        let r = ctx.refer(e1.cast());
        assert!(reference::notify(r));
        ctx.cache_recycle();
        ctx.reset_position();
        let empty = ctx.list_get(0);
        let out = ctx.stage_io(PointRecord::new(point, 0), empty, 0);
        assert_eq!(staged_ptrs(out), alloc::vec![e1.cast::<u8>()]);
    }

    #[test]
    fn test_aux_match_filters_stage_in() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { crate::machine::Ctx::new(machine) };

        let e1 = ctx.get();
        let e2 = ctx.get();
        let input = ctx.list_get(2);
        input.push(e1.cast(), 1);
        input.push(e2.cast(), 2);

        let out = ctx.stage_io(point_record!("aux_filter"), input, 1);
        assert_eq!(staged_ptrs(out), alloc::vec![e1.cast::<u8>()]);
    }

    #[test]
    fn test_null_and_freed_slots_skipped() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { crate::machine::Ctx::new(machine) };

        let e1 = ctx.get();
        let e2 = ctx.get();
        unsafe { ctx.put(e2) };

        let input = ctx.list_get(4);
        input.push(core::ptr::null_mut(), 0);
        input.push(e1.cast(), 0);
        input.push(e2.cast(), 0); // freed: does not resolve

        let out = ctx.stage_io(point_record!("skip_dead"), input, 0);
        assert_eq!(staged_ptrs(out), alloc::vec![e1.cast::<u8>()]);
    }

    #[test]
    fn test_interior_pointers_survive_staging() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { crate::machine::Ctx::new(machine) };

        let e = ctx.get();
        let interior = unsafe { e.cast::<u8>().add(16) };
        let input = ctx.list_get(1);
        input.push(interior, 0);

        let out = ctx.stage_io(point_record!("interior"), input, 0);
        assert_eq!(staged_ptrs(out), alloc::vec![interior]);
    }

    #[test]
    fn test_restaging_moves_between_queues() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { crate::machine::Ctx::new(machine) };

        let e = ctx.get();
        let point_a = program_point!("queue_a");
        let point_b = program_point!("queue_b");

        let input = ctx.list_get(1);
        input.push(e.cast(), 0);
        let out_a = ctx.stage_io(PointRecord::new(point_a, 0), input, 0);
        assert_eq!(out_a.size(), 1);

        // Move the entry to queue B; queue A must no longer own it.
        let moved = ctx.list_get(1);
        moved.push(e.cast(), 0);
        let out_b = ctx.stage_io(PointRecord::new(point_b, 0), moved, 0);
        assert_eq!(staged_ptrs(out_b), alloc::vec![e.cast::<u8>()]);

        ctx.cache_recycle();
        ctx.reset_position();
        assert!(reference::notify(ctx.refer(e.cast())));
        let empty = ctx.list_get(0);
        let out_a = ctx.stage_io(PointRecord::new(point_a, 0), empty, 0);
        assert_eq!(out_a.size(), 0);
        let empty = ctx.list_get(0);
        let out_b = ctx.stage_io(PointRecord::new(point_b, 0), empty, 0);
        assert_eq!(out_b.size(), 1);
    }

    #[test]
    fn test_stage_in_is_idempotent_within_frame() {
        let machine = leak_machine(8, ELSIZE);
        let mut ctx = unsafe { crate::machine::Ctx::new(machine) };

        let e = ctx.get();
        let point = program_point!("idempotent");

        let input = ctx.list_get(1);
        input.push(e.cast(), 0);
        let out = ctx.stage_io(PointRecord::new(point, 0), input, 0);
        assert_eq!(out.size(), 1);

        // Re-staging in the next frame re-arms the wake-up but files the
        // entry under the same queue exactly once.
        ctx.cache_recycle();
        ctx.reset_position();
        let input = ctx.list_get(1);
        input.push(e.cast(), 0);
        let out = ctx.stage_io(PointRecord::new(point, 0), input, 0);
        assert_eq!(staged_ptrs(out), alloc::vec![e.cast::<u8>()]);
    }
}
