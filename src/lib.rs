#![no_std]

//! imsm: a runtime substrate for immediate-mode state machines.
//!
//! An immediate-mode state machine (IMSM) is an event-driven server written
//! as a single poll function that re-derives, from scratch on every frame,
//! the work each live object needs. The substrate supplies four tiers:
//! - A magazine-based slab allocator over a caller-supplied arena
//!   (type-stable slots, O(1) hot path)
//! - 64-bit versioned references that dereference safely after free
//! - Program-point indexing that maps straight-line poll code to stable
//!   per-frame state indices
//! - A staging operator that batches objects through per-point queues
//!
//! # Usage
//!
//! ```ignore
//! fn poll(ctx: &mut Ctx) {
//!     let accepted = accept_new(ctx);
//!     let readable = ctx.stage_io(point_record!("readable"), accepted, 0);
//!     // ... drive I/O for every entry in `readable` ...
//! }
//! ```
//!
//! See `demos/echo.rs` for a complete pipeline.

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

/// Build-time tunables generated by `build.rs` from `imsm.toml`.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
}

pub mod entry;
pub mod harness;
pub mod list;
pub mod machine;
mod macros;
pub mod ppoint;
pub mod reference;
pub mod registry;
pub mod slab;
pub mod stage;
#[cfg(feature = "stats")]
pub mod stats;
pub mod typed;

// Re-export the working surface at the crate root for convenience.
pub use entry::{Entry, QUEUE_NONE};
pub use harness::{Driver, EventSource};
pub use list::{List, ListCache};
pub use machine::{Ctx, Machine};
pub use ppoint::{PointRecord, ProgramPoint, Region};
pub use reference::{Ref, deref, deref_machine, notify};
pub use typed::{EntryFirst, StateMachine, TypedList};
