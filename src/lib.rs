//! Interrupt and DMA driven peripheral drivers for the RP235x microcontrollers
//!
//! This crate provides drivers for the I2C, UART and SPI blocks of the RP2350
//! together with an allocator for its 16 interchangeable DMA channels. The
//! drivers share one transfer engine: a calling thread fills or drains the
//! peripheral FIFO directly for as long as the FIFO allows, hands the
//! remainder of the request to the peripheral interrupt handler, and sleeps
//! until the handler (or a DMA completion interrupt) signals that the request
//! has been consumed. Large transfers are offloaded to a borrowed DMA channel
//! instead of being pumped byte by byte.
//!
//! The write side of the low-level I2C interface is asynchronous: a write
//! method may return before all of its bytes or command words have reached
//! the FIFO. Call [`i2c::I2cMaster::flush`] (or issue the next write) before
//! reusing the buffer. The connection-oriented interface and the
//! `embedded-hal`/`embedded-io` trait implementations take care of this
//! internally and are the API most applications want.
//!
//! # Interrupt wiring
//!
//! The engine does nothing behind your back: you decide which core services
//! which interrupt and bind the handlers yourself.
//!
//! ```no_run
//! use rp235x_async_drivers::{i2c::I2cMaster, pac};
//!
//! // Call these from the I2C0_IRQ and DMA_IRQ_n handlers registered with
//! // your runtime (e.g. via cortex-m-rt's `#[interrupt]` attribute):
//! fn i2c0_irq() {
//!     I2cMaster::<pac::I2C0>::on_interrupt();
//! }
//!
//! fn dma_irq_0() {
//!     I2cMaster::<pac::I2C0>::on_dma_interrupt();
//! }
//! # let _ = (i2c0_irq, dma_irq_0);
//! ```
//!
//! # Crate features
//!
//! * **defmt** -
//!   Implement `defmt::Format` for several types.
//! * **rt** -
//!   Minimal startup / runtime for Cortex-M microcontrollers

#![warn(missing_docs)]
#![no_std]

/// Re-export of the PAC
pub use rp235x_pac as pac;

pub mod arch;
pub(crate) mod atomic_register_access;
pub mod dma;
pub mod i2c;
pub mod note;
pub mod resets;
pub mod spi;
pub mod typelevel;
pub mod uart;

pub use dma::DmaPool;
pub use i2c::I2cMaster;
pub use spi::SpiMaster;
pub use uart::UartDriver;

// Re-export crates used in this crate's public API
pub extern crate fugit;

/// Index of the core this is running on (0 or 1).
///
/// The drivers use it to pick a DMA interrupt line per requesting core so
/// completion interrupts spread over both cores instead of piling up on one.
pub(crate) fn core_id() -> u8 {
    unsafe { (*pac::SIO::ptr()).cpuid().read().bits() as u8 }
}
