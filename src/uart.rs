//! Universal Asynchronous Receiver Transmitter (UART)
//!
//! See [Section 12.1](https://rptl.io/rp2350-datasheet#section_uart) of the
//! datasheet for more details.
//!
//! The driver pumps the PL011 FIFOs with the same engine as the I2C master:
//! the calling thread fills or drains the FIFO directly for as long as the
//! FIFO allows, and only hands the remainder to the interrupt handler before
//! going to sleep. Bind [`UartDriver::on_interrupt`] to the matching
//! UART0_IRQ/UART1_IRQ.
//!
//! ```no_run
//! use rp235x_async_drivers::fugit::RateExtU32;
//! use rp235x_async_drivers::uart::{DataBits, StopBits, UartConfig, UartDriver};
//!
//! let mut pac = rp235x_pac::Peripherals::take().unwrap();
//! let mut uart = UartDriver::new(pac.UART0);
//! uart.setup(
//!     UartConfig::new(115_200.Hz(), DataBits::Eight, None, StopBits::One),
//!     &mut pac.RESETS,
//!     125_000_000.Hz(),
//! );
//! uart.write(b"hello\r\n").unwrap();
//! ```

use core::cmp::min;
use core::ops::Deref;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use fugit::HertzU32;

use crate::arch;
use crate::atomic_register_access::{write_bitmask_clear, write_bitmask_set};
use crate::note::Note;
use crate::pac;
use crate::resets::SubsystemReset;
use crate::typelevel::Sealed;

/// Depth of the PL011 Tx and Rx FIFOs.
const FIFO_DEPTH: usize = 32;

// UARTCR bits
const UARTEN: u32 = 1 << 0;
const TXE: u32 = 1 << 8;
const RXE: u32 = 1 << 9;

// UARTIMSC bits
const RXIM: u32 = 1 << 4;
const TXIM: u32 = 1 << 5;
const RTIM: u32 = 1 << 6;

/// Pac UART device
pub trait UartDevice: Deref<Target = pac::uart0::RegisterBlock> + SubsystemReset + Sealed {
    /// Index of the peripheral.
    const ID: usize;
    #[doc(hidden)]
    fn state() -> &'static UartState;
    #[doc(hidden)]
    fn regs() -> &'static pac::uart0::RegisterBlock;
}

macro_rules! uart_device {
    ($UARTX:ident, $id:expr) => {
        impl Sealed for pac::$UARTX {}
        impl UartDevice for pac::$UARTX {
            const ID: usize = $id;
            fn state() -> &'static UartState {
                static STATE: UartState = UartState::new();
                &STATE
            }
            fn regs() -> &'static pac::uart0::RegisterBlock {
                unsafe { &*pac::$UARTX::ptr() }
            }
        }
    };
}
uart_device!(UART0, 0);
uart_device!(UART1, 1);

/// UART error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The configured timeout expired before the transfer finished.
    Timeout,
    /// Data was received while the Rx FIFO was full.
    Overrun,
    /// A break condition was received.
    Break,
    /// The received parity did not match.
    Parity,
    /// No valid stop bit was seen.
    Framing,
}

/// Data word length, LCR_H.WLEN encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataBits {
    /// 5 bits
    Five = 0,
    /// 6 bits
    Six = 1,
    /// 7 bits
    Seven = 2,
    /// 8 bits
    Eight = 3,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    /// 1 stop bit
    One,
    /// 2 stop bits
    Two,
}

/// Parity mode, when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Line configuration for [`UartDriver::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartConfig {
    /// Wire speed.
    pub baudrate: HertzU32,
    /// Word length.
    pub data_bits: DataBits,
    /// Parity, `None` to disable.
    pub parity: Option<Parity>,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl UartConfig {
    /// Creates a new configuration.
    pub const fn new(
        baudrate: HertzU32,
        data_bits: DataBits,
        parity: Option<Parity>,
        stop_bits: StopBits,
    ) -> Self {
        Self {
            baudrate,
            data_bits,
            parity,
            stop_bits,
        }
    }
}

/// Per-instance engine state shared with the interrupt handler. A count of
/// zero means the direction is idle; publish order is the same as the I2C
/// engine's (descriptor, then count with release, interrupt mask last).
#[doc(hidden)]
pub struct UartState {
    wdata: AtomicPtr<u8>,
    wi: AtomicUsize,
    wn: AtomicUsize,
    wdone: Note,

    rdata: AtomicPtr<u8>,
    ri: AtomicUsize,
    rn: AtomicUsize,
    rdone: Note,
}

impl UartState {
    const fn new() -> Self {
        Self {
            wdata: AtomicPtr::new(core::ptr::null_mut()),
            wi: AtomicUsize::new(0),
            wn: AtomicUsize::new(0),
            wdone: Note::new(),
            rdata: AtomicPtr::new(core::ptr::null_mut()),
            ri: AtomicUsize::new(0),
            rn: AtomicUsize::new(0),
            rdone: Note::new(),
        }
    }
}

/// Computes the IBRD/FBRD divisor pair for the requested baudrate.
fn baud_divisors(baudrate: u32, peri_hz: u32) -> (u16, u8) {
    let brdiv8 = (8 * peri_hz as u64 / baudrate as u64) as u32 + 1;
    let mut ibrd = brdiv8 >> 7;
    let mut fbrd = (brdiv8 & 0x7f) >> 1;
    if ibrd == 0 {
        ibrd = 1;
        fbrd = 0;
    } else if ibrd >= 0xffff {
        ibrd = 0xffff;
        fbrd = 0;
    }
    (ibrd as u16, fbrd as u8)
}

/// Interrupt-driven UART driver.
pub struct UartDriver<D: UartDevice> {
    uart: D,
    write_timeout_us: u32,
    read_timeout_us: u32,
}

impl<D: UartDevice> UartDriver<D> {
    /// Returns a new driver for the peripheral. Call [`UartDriver::setup`]
    /// before use.
    pub fn new(uart: D) -> Self {
        Self {
            uart,
            write_timeout_us: 0,
            read_timeout_us: 0,
        }
    }

    /// Resets the peripheral, programs the line configuration and baudrate,
    /// and enables the transmitter and receiver.
    pub fn setup(&mut self, config: UartConfig, resets: &mut pac::RESETS, system_clock: HertzU32) {
        self.uart.reset_bring_down(resets);
        self.uart.reset_bring_up(resets);

        let (ibrd, fbrd) = baud_divisors(config.baudrate.to_Hz(), system_clock.to_Hz());
        self.uart
            .uartibrd()
            .write(|w| unsafe { w.baud_divint().bits(ibrd) });
        self.uart
            .uartfbrd()
            .write(|w| unsafe { w.baud_divfrac().bits(fbrd) });

        // This write also latches the divisor registers above.
        self.uart.uartlcr_h().write(|w| {
            unsafe {
                w.wlen().bits(config.data_bits as u8);
            }
            w.stp2().bit(matches!(config.stop_bits, StopBits::Two));
            if let Some(parity) = config.parity {
                w.pen().set_bit();
                w.eps().bit(matches!(parity, Parity::Even));
            }
            w.fen().set_bit();
            w
        });

        // Interrupt at half FIFO in both directions.
        self.uart
            .uartifls()
            .modify(|_, w| unsafe { w.txiflsel().bits(2).rxiflsel().bits(2) });

        self.uart.uartcr().write(|w| {
            w.uarten().set_bit();
            w.txe().set_bit();
            w.rxe().set_bit()
        });
    }

    /// Releases the peripheral.
    pub fn free(self, resets: &mut pac::RESETS) -> D {
        self.uart.reset_bring_down(resets);
        self.uart
    }

    /// The configured baudrate, recomputed from the divisor registers.
    pub fn baudrate(&self, system_clock: HertzU32) -> HertzU32 {
        let ibrd = self.uart.uartibrd().read().baud_divint().bits() as u64;
        let fbrd = self.uart.uartfbrd().read().baud_divfrac().bits() as u64;
        HertzU32::from_raw((4 * system_clock.to_Hz() as u64 / (ibrd * 64 + fbrd)) as u32)
    }

    /// Gives up on a write that the interrupt handler cannot finish within
    /// `micros` microseconds. Zero (the default) waits forever.
    pub fn set_write_timeout(&mut self, micros: u32) {
        self.write_timeout_us = micros;
    }

    /// Like [`UartDriver::set_write_timeout`] for the read side.
    pub fn set_read_timeout(&mut self, micros: u32) {
        self.read_timeout_us = micros;
    }

    /// Enables the transmitter.
    pub fn enable_tx(&mut self) {
        unsafe { write_bitmask_set(D::regs().uartcr().as_ptr(), UARTEN | TXE) }
    }

    /// Waits for the end of transmission (see [`UartDriver::wait_tx_done`])
    /// and disables the transmitter.
    pub fn disable_tx(&mut self) {
        self.wait_tx_done();
        unsafe { write_bitmask_clear(D::regs().uartcr().as_ptr(), TXE) }
    }

    /// Enables the receiver.
    pub fn enable_rx(&mut self) {
        unsafe { write_bitmask_set(D::regs().uartcr().as_ptr(), UARTEN | RXE) }
    }

    /// Disables the receiver.
    pub fn disable_rx(&mut self) {
        unsafe { write_bitmask_clear(D::regs().uartcr().as_ptr(), RXE) }
    }

    /// Waits until the last byte, stop bits included, has left the shift
    /// register. Idempotent; returns immediately when the transmitter is
    /// idle.
    pub fn wait_tx_done(&mut self) {
        let regs = D::regs();
        while regs.uartfr().read().busy().bit_is_set() {
            arch::nop();
        }
    }

    /// Writes `data`, blocking until everything is in the FIFO or the write
    /// timeout expires. Returns the number of bytes accepted.
    ///
    /// Return does not mean the data has been transmitted, only queued; see
    /// [`UartDriver::wait_tx_done`].
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let regs = D::regs();
        let mut n = 0;
        // The overhead of setting up a tight burst pays off above a few
        // bytes: the FIFO has 32 free slots when completely empty and at
        // least 16 when the level interrupt flag is raised.
        if data.len() > 3 {
            let m = if regs.uartfr().read().txfe().bit_is_set() {
                FIFO_DEPTH
            } else if regs.uartris().read().txris().bit_is_set() {
                FIFO_DEPTH / 2
            } else {
                0
            };
            if m != 0 {
                n = min(m, data.len());
                for &b in &data[..n] {
                    regs.uartdr().write(|w| unsafe { w.data().bits(b) });
                }
                if n == data.len() {
                    return Ok(n);
                }
            }
        }
        // Check-before-every-store path; preemption can change the FIFO
        // level under us at any point.
        while regs.uartfr().read().txff().bit_is_clear() {
            regs.uartdr().write(|w| unsafe { w.data().bits(data[n]) });
            n += 1;
            if n >= data.len() {
                return Ok(n);
            }
        }
        // The interrupt handler writes the rest.
        self.wait_write_isr(&data[n..])?;
        Ok(data.len())
    }

    /// Writes one byte, leaving it to the interrupt handler when the FIFO is
    /// full.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
        let regs = D::regs();
        if regs.uartfr().read().txff().bit_is_clear() {
            regs.uartdr().write(|w| unsafe { w.data().bits(byte) });
            return Ok(());
        }
        self.wait_write_isr(&[byte])
    }

    fn wait_write_isr(&mut self, rest: &[u8]) -> Result<(), Error> {
        let st = D::state();
        st.wi.store(0, Ordering::Relaxed);
        st.wdata.store(rest.as_ptr() as *mut u8, Ordering::Relaxed);
        st.wn.store(rest.len(), Ordering::Release);
        unsafe { write_bitmask_set(D::regs().uartimsc().as_ptr(), TXIM) };
        let completed = st.wdone.wait_timeout(self.write_timeout_us);
        if !completed {
            // The handler may still finish between the check and this
            // teardown; masking first keeps it from re-arming.
            unsafe { write_bitmask_clear(D::regs().uartimsc().as_ptr(), TXIM) };
            st.wn.store(0, Ordering::Release);
        }
        st.wdone.clear();
        st.wdata.store(core::ptr::null_mut(), Ordering::Relaxed);
        if completed {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Reads at least one byte into `buf`, blocking (up to the read timeout)
    /// when nothing is buffered yet. Returns how many bytes were read.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let regs = D::regs();
        let mut n = 0;
        while regs.uartfr().read().rxfe().bit_is_clear() {
            let dr = regs.uartdr().read();
            rx_error(&dr)?;
            buf[n] = dr.data().bits();
            n += 1;
            if n == buf.len() {
                return Ok(n);
            }
        }
        if n > 0 {
            return Ok(n);
        }
        // Nothing buffered: let the interrupt handler deliver the first
        // chunk. RTIM catches tails shorter than the FIFO threshold.
        let st = D::state();
        st.ri.store(0, Ordering::Relaxed);
        st.rdata.store(buf.as_mut_ptr(), Ordering::Relaxed);
        st.rn.store(buf.len(), Ordering::Release);
        unsafe { write_bitmask_set(regs.uartimsc().as_ptr(), RXIM | RTIM) };
        let completed = st.rdone.wait_timeout(self.read_timeout_us);
        if !completed {
            unsafe { write_bitmask_clear(regs.uartimsc().as_ptr(), RXIM | RTIM) };
            st.rn.store(0, Ordering::Release);
        }
        st.rdone.clear();
        let got = st.ri.load(Ordering::Relaxed);
        st.rdata.store(core::ptr::null_mut(), Ordering::Relaxed);
        if got == 0 && !completed {
            Err(Error::Timeout)
        } else {
            Ok(got)
        }
    }

    /// Reads one byte, blocking when none is buffered.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        let mut b = [0u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    /// The peripheral's interrupt handler. Bind it to the UART0_IRQ or
    /// UART1_IRQ matching the driven instance.
    pub fn on_interrupt() {
        let regs = D::regs();
        let st = D::state();

        // Mask everything first; unfinished directions re-arm below. The
        // counts are zeroed before any wake-up, so a stale re-entry finds
        // nothing to do.
        unsafe {
            regs.uartimsc().write_with_zero(|w| w);
        }

        let mut enable = 0u32;

        // Rx: drain whatever arrived and wake the reader as soon as it has
        // at least one byte.
        let rn = st.rn.load(Ordering::Acquire);
        if rn > 0 {
            let data = st.rdata.load(Ordering::Relaxed);
            let mut i = st.ri.load(Ordering::Relaxed);
            while i < rn && regs.uartfr().read().rxfe().bit_is_clear() {
                unsafe { data.add(i).write(regs.uartdr().read().data().bits()) };
                i += 1;
            }
            st.ri.store(i, Ordering::Relaxed);
            // Let the idle-gap interrupt fire again for the next tail.
            regs.uarticr().write(|w| w.rtic().clear_bit_by_one());
            if i > 0 {
                st.rn.store(0, Ordering::Release);
                st.rdone.wake();
            } else {
                enable |= RXIM | RTIM;
            }
        }

        // Tx refill.
        let wn = st.wn.load(Ordering::Acquire);
        if wn > 0 {
            let data = st.wdata.load(Ordering::Relaxed);
            let mut i = st.wi.load(Ordering::Relaxed);
            while i < wn && regs.uartfr().read().txff().bit_is_clear() {
                let b = unsafe { data.add(i).read() };
                regs.uartdr().write(|w| unsafe { w.data().bits(b) });
                i += 1;
            }
            st.wi.store(i, Ordering::Relaxed);
            if i == wn {
                st.wn.store(0, Ordering::Release);
                st.wdone.wake();
            } else {
                enable |= TXIM;
            }
        }

        if enable != 0 {
            unsafe { write_bitmask_set(regs.uartimsc().as_ptr(), enable) };
        }
    }
}

fn rx_error(dr: &pac::uart0::uartdr::R) -> Result<(), Error> {
    if dr.oe().bit_is_set() {
        Err(Error::Overrun)
    } else if dr.be().bit_is_set() {
        Err(Error::Break)
    } else if dr.pe().bit_is_set() {
        Err(Error::Parity)
    } else if dr.fe().bit_is_set() {
        Err(Error::Framing)
    } else {
        Ok(())
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Error::Timeout => embedded_io::ErrorKind::TimedOut,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl<D: UartDevice> embedded_io::ErrorType for UartDriver<D> {
    type Error = Error;
}

impl<D: UartDevice> embedded_io::Write for UartDriver<D> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        UartDriver::write(self, buf)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.wait_tx_done();
        Ok(())
    }
}

impl<D: UartDevice> embedded_io::Read for UartDriver<D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        UartDriver::read(self, buf)
    }
}

impl embedded_hal_nb::serial::Error for Error {
    fn kind(&self) -> embedded_hal_nb::serial::ErrorKind {
        use embedded_hal_nb::serial::ErrorKind;
        match self {
            Error::Overrun => ErrorKind::Overrun,
            Error::Parity => ErrorKind::Parity,
            Error::Framing => ErrorKind::FrameFormat,
            _ => ErrorKind::Other,
        }
    }
}

impl<D: UartDevice> embedded_hal_nb::serial::ErrorType for UartDriver<D> {
    type Error = Error;
}

impl<D: UartDevice> embedded_hal_nb::serial::Read<u8> for UartDriver<D> {
    fn read(&mut self) -> nb::Result<u8, Error> {
        let regs = D::regs();
        if regs.uartfr().read().rxfe().bit_is_set() {
            return Err(nb::Error::WouldBlock);
        }
        let dr = regs.uartdr().read();
        rx_error(&dr)?;
        Ok(dr.data().bits())
    }
}

impl<D: UartDevice> embedded_hal_nb::serial::Write<u8> for UartDriver<D> {
    fn write(&mut self, word: u8) -> nb::Result<(), Error> {
        let regs = D::regs();
        if regs.uartfr().read().txff().bit_is_set() {
            return Err(nb::Error::WouldBlock);
        }
        regs.uartdr().write(|w| unsafe { w.data().bits(word) });
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Error> {
        if D::regs().uartfr().read().busy().bit_is_set() {
            return Err(nb::Error::WouldBlock);
        }
        Ok(())
    }
}

impl<D: UartDevice> core::fmt::Write for UartDriver<D> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.write(s.as_bytes()).map_err(|_| core::fmt::Error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_divisors_115200_at_125mhz() {
        // Reference values from the datasheet's worked example.
        assert_eq!(baud_divisors(115_200, 125_000_000), (67, 52));
    }

    #[test]
    fn baud_divisors_9600_at_125mhz() {
        assert_eq!(baud_divisors(9_600, 125_000_000), (813, 51));
    }

    #[test]
    fn baud_divisors_clamp() {
        // Divisor too small: clamp to the fastest representable rate.
        assert_eq!(baud_divisors(100_000_000, 125_000_000), (1, 0));
        // Divisor too large: clamp to the slowest.
        assert_eq!(baud_divisors(1, 125_000_000), (0xffff, 0));
    }
}
