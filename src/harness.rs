//! Poll harness: drives one machine, frame by frame.
//!
//! A frame is: drain the external notifier, run the user's poll function,
//! recycle the frame's scratch lists, reset the program position. The
//! harness never blocks anywhere except in the notifier itself, and never
//! interprets cookie bits; that is the reference codec's job.

use crate::machine::{Ctx, Machine};
use crate::reference::{self, Ref};
use crate::stat_inc;
use core::time::Duration;

/// Source of readiness events, delivering the 64-bit cookies previously
/// armed with [`Ctx::refer`](crate::Ctx::refer).
///
/// Implementations block for at most `timeout` waiting for the first event,
/// then deliver whatever is immediately available. Cookies are opaque:
/// forward them bit-for-bit.
pub trait EventSource {
    fn poll(&mut self, timeout: Duration, sink: &mut dyn FnMut(Ref));
}

/// An event source that never delivers anything; frames then run on their
/// own cadence (timers, tests, draining shutdown).
pub struct NullSource;

impl EventSource for NullSource {
    fn poll(&mut self, _timeout: Duration, _sink: &mut dyn FnMut(Ref)) {}
}

/// Owns the context for one machine and runs its frames.
pub struct Driver {
    ctx: Ctx,
}

impl Driver {
    /// Builds a driver over an initialized machine.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ctx::new`]: `machine` is initialized, never moves,
    /// and is driven by one thread at a time.
    pub unsafe fn new(machine: *mut Machine) -> Driver {
        Driver {
            ctx: unsafe { Ctx::new(machine) },
        }
    }

    /// The driven machine's context, e.g. for staging work from outside the
    /// poll function during start-up.
    #[inline]
    pub fn ctx(&mut self) -> &mut Ctx {
        &mut self.ctx
    }

    /// Runs a single frame: notifications, poll, recycle, position reset.
    pub fn frame(&mut self, source: &mut dyn EventSource, timeout: Duration) {
        stat_inc!(frames);

        source.poll(timeout, &mut |r| {
            if !reference::notify(r) {
                log::debug!("dropping corrupt notification cookie {:#x}", r.bits());
            }
        });

        let machine = self.ctx.machine_ptr();
        let Some(poll_fn) = (unsafe { (*machine).poll_fn }) else {
            panic!("driven machine must be initialized");
        };
        log::trace!("frame for machine {}", unsafe { (*machine).global_index() });

        poll_fn(&mut self.ctx);
        self.ctx.cache.recycle();
        self.ctx.reset_position();
    }

    /// Runs frames until `done` reports true, checking after each frame.
    pub fn run_until(
        &mut self,
        source: &mut dyn EventSource,
        timeout: Duration,
        mut done: impl FnMut(&mut Ctx) -> bool,
    ) {
        loop {
            self.frame(source, timeout);
            if done(&mut self.ctx) {
                return;
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use std::sync::mpsc::{Receiver, TryRecvError};

        /// Any channel of raw cookies works as an event source: one blocking
        /// receive up to the timeout, then a non-blocking drain.
        impl EventSource for Receiver<u64> {
            fn poll(&mut self, timeout: Duration, sink: &mut dyn FnMut(Ref)) {
                match self.recv_timeout(timeout) {
                    Ok(bits) => sink(Ref::from_bits(bits)),
                    Err(_) => return,
                }

                loop {
                    match self.try_recv() {
                        Ok(bits) => sink(Ref::from_bits(bits)),
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::tests::leak_machine;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FRAMES_POLLED: AtomicUsize = AtomicUsize::new(0);

    fn counting_poll(_ctx: &mut Ctx) {
        FRAMES_POLLED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_frame_runs_poll_and_resets() {
        let machine = leak_machine(2, 32);
        unsafe { (*machine).poll_fn = Some(counting_poll) };

        let mut driver = unsafe { Driver::new(machine) };
        let before = FRAMES_POLLED.load(Ordering::Relaxed);

        // Leave the position dirty; the frame must reset it.
        driver.ctx().index(crate::point_record!("dirty"));
        driver.frame(&mut NullSource, Duration::from_millis(0));

        assert_eq!(FRAMES_POLLED.load(Ordering::Relaxed), before + 1);
        assert!(driver.ctx().position.ppoint.is_null());
        assert_eq!(driver.ctx().position.index, 0);
    }

    struct OneShot(u64, bool);

    impl EventSource for OneShot {
        fn poll(&mut self, _timeout: Duration, sink: &mut dyn FnMut(Ref)) {
            if !self.1 {
                self.1 = true;
                sink(Ref::from_bits(self.0));
            }
        }
    }

    #[test]
    fn test_frame_delivers_notifications() {
        let machine = leak_machine(2, 32);
        unsafe { (*machine).poll_fn = Some(counting_poll) };
        let mut driver = unsafe { Driver::new(machine) };

        let entry = driver.ctx().get();
        let r = driver.ctx().refer(entry.cast());

        let mut source = OneShot(r.bits(), false);
        driver.frame(&mut source, Duration::from_millis(0));
        assert_ne!(unsafe { (*entry).wakeup_pending }, 0);
    }

    #[test]
    fn test_corrupt_cookie_is_dropped() {
        let machine = leak_machine(2, 32);
        unsafe { (*machine).poll_fn = Some(counting_poll) };
        let mut driver = unsafe { Driver::new(machine) };

        // A cookie decoding to machine 0 can never wake anything.
        let mut source = OneShot(crate::reference::Ref::NULL.bits() | 1, false);
        driver.frame(&mut source, Duration::from_millis(0));
    }

    #[test]
    fn test_run_until_counts_frames() {
        let machine = leak_machine(2, 32);
        unsafe { (*machine).poll_fn = Some(counting_poll) };
        let mut driver = unsafe { Driver::new(machine) };

        let mut frames = 0;
        driver.run_until(&mut NullSource, Duration::from_millis(0), |_ctx| {
            frames += 1;
            frames == 5
        });
        assert_eq!(frames, 5);
    }
}
