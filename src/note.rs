//! One-shot notification primitive
//!
//! A [`Note`] is a single-slot blocking handoff between a thread and another
//! context of execution (typically an interrupt handler): the thread parks on
//! [`Note::wait`] until somebody calls [`Note::wake`]. Multiple wakes before
//! the next `wait`/`clear` cycle coalesce into one. After a successful wait
//! the owner calls [`Note::clear`] to make the slot reusable.
//!
//! The blocking wait uses the event register semantics of `WFE`/`SEV`: a
//! wake from an interrupt handler on either core sets the event flag, so the
//! sleeping core re-checks the slot without a lost-wakeup window.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::pac;

/// A single-slot blocking handoff.
pub struct Note {
    flag: AtomicBool,
}

impl Note {
    /// Creates an unset note.
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Sets the note and wakes every core that is parked in [`Note::wait`].
    ///
    /// Safe to call from interrupt handlers. Wakes that arrive while no one
    /// is waiting are remembered until the next `wait`/`clear` cycle.
    #[inline]
    pub fn wake(&self) {
        self.flag.store(true, Ordering::Release);
        arch::sev();
    }

    /// Blocks the calling thread until the note is set.
    ///
    /// Returns immediately if the note was already set.
    pub fn wait(&self) {
        while !self.flag.load(Ordering::Acquire) {
            arch::wfe();
        }
    }

    /// Like [`Note::wait`] but gives up after `micros` microseconds.
    ///
    /// Returns `true` if the note was set, `false` on timeout. A timeout of
    /// zero means wait forever. The timed variant polls the system timer
    /// instead of sleeping, so use it for exceptional waits, not steady-state
    /// ones.
    pub fn wait_timeout(&self, micros: u32) -> bool {
        if micros == 0 {
            self.wait();
            return true;
        }
        let start = timer_us();
        while !self.flag.load(Ordering::Acquire) {
            if timer_us().wrapping_sub(start) >= micros {
                return self.flag.load(Ordering::Acquire);
            }
            core::hint::spin_loop();
        }
        true
    }

    /// Resets the note to the unset state.
    #[inline]
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Whether the note is currently set.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Default for Note {
    fn default() -> Self {
        Self::new()
    }
}

/// The low word of TIMER0's free-running microsecond counter.
fn timer_us() -> u32 {
    // TIMERAWL reads have no side effects, so borrowing the register here
    // does not conflict with an owned Timer driver elsewhere.
    unsafe { (*pac::TIMER0::ptr()).timerawl().read().bits() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_wait_returns() {
        let n = Note::new();
        n.wake();
        n.wait();
        assert!(n.is_set());
    }

    #[test]
    fn wakes_coalesce() {
        let n = Note::new();
        n.wake();
        n.wake();
        n.wait();
        n.clear();
        assert!(!n.is_set());
    }
}
