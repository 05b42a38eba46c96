//! Portable in-line assembly
//!
//! Replaces `cortex_m::asm` with things that work on RISC-V and Arm, plus a
//! host stand-in so the pure-logic parts of this crate can be unit tested.

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod inner {
    #[doc(inline)]
    pub use cortex_m::asm::{delay, nop, sev, wfe};
}

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
mod inner {
    #[doc(inline)]
    pub use riscv::asm::{delay, nop};

    /// Send Event
    #[inline(always)]
    pub fn sev() {
        unsafe {
            // This is how h3.unblock is encoded.
            core::arch::asm!("slt x0, x0, x1");
        }
    }

    /// Wait for Event
    pub fn wfe() {
        unsafe {
            // This is how h3.block is encoded.
            core::arch::asm!("slt x0, x0, x0");
        }
    }
}

#[cfg(not(target_os = "none"))]
mod inner {
    /// No-op stand-in for the target instruction.
    #[inline(always)]
    pub fn nop() {}

    /// No-op stand-in for the target instruction.
    #[inline(always)]
    pub fn sev() {}

    /// Spin stand-in for the target instruction.
    #[inline(always)]
    pub fn wfe() {
        core::hint::spin_loop();
    }

    /// No-op stand-in for the target delay loop.
    #[inline(always)]
    pub fn delay(_cycles: u32) {}
}

pub use inner::*;
