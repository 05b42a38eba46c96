//! Serial Peripheral Interface (SPI) master
//!
//! See [Section 12.3](https://rptl.io/rp2350-datasheet#section_spi) of the
//! datasheet for more details.
//!
//! The master is a structural twin of the I2C transfer engine with the
//! polling half dominant: the PL022 FIFOs are only 8 words deep and SPI has
//! no flow control to stall on, so short transfers are pumped from the
//! calling thread with a check-before-every-store loop, and only transfers
//! large enough to amortize channel programming are handed to DMA. The DMA
//! completion interrupt is routed through the same notification primitive
//! the other drivers sleep on; bind [`SpiMaster::on_dma_interrupt`] when
//! channels are bound.
//!
//! Writes leave unread garbage in the Rx FIFO; the driver tracks that and
//! drains it before the next read.

use core::cmp::{max, min};
use core::convert::Infallible;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

use embedded_hal::spi::{Mode, Phase, Polarity};
use fugit::HertzU32;

use crate::arch;
use crate::dma::{self, DmaChannel, DmaConfig, NO_CHANNEL};
use crate::note::Note;
use crate::pac;
use crate::pac::dma::ch::ch_ctrl_trig::TREQ_SEL_A;
use crate::resets::SubsystemReset;
use crate::typelevel::Sealed;

/// Depth of the PL022 Tx and Rx FIFOs.
const FIFO_DEPTH: usize = 8;

/// Transfers at or above this size go through DMA when a channel is bound.
const MIN_DMA: usize = 32;

/// Pac SPI device
pub trait SpiDevice: Deref<Target = pac::spi0::RegisterBlock> + SubsystemReset + Sealed {
    /// Index of the peripheral.
    const ID: usize;
    #[doc(hidden)]
    fn state() -> &'static SpiState;
    #[doc(hidden)]
    fn regs() -> &'static pac::spi0::RegisterBlock;
    #[doc(hidden)]
    fn tx_treq() -> u8;
    #[doc(hidden)]
    fn rx_treq() -> u8;
}

macro_rules! spi_device {
    ($SPIX:ident, $id:expr, $TX:ident, $RX:ident) => {
        impl Sealed for pac::$SPIX {}
        impl SpiDevice for pac::$SPIX {
            const ID: usize = $id;
            fn state() -> &'static SpiState {
                static STATE: SpiState = SpiState::new();
                &STATE
            }
            fn regs() -> &'static pac::spi0::RegisterBlock {
                unsafe { &*pac::$SPIX::ptr() }
            }
            fn tx_treq() -> u8 {
                TREQ_SEL_A::$TX.into()
            }
            fn rx_treq() -> u8 {
                TREQ_SEL_A::$RX.into()
            }
        }
    };
}
spi_device!(SPI0, 0, SPI0_TX, SPI0_RX);
spi_device!(SPI1, 1, SPI1_TX, SPI1_RX);

/// DMA completion state shared with the interrupt handler.
#[doc(hidden)]
pub struct SpiState {
    done: Note,
    active_ch: AtomicU8,
    irq_slot: AtomicU8,
}

impl SpiState {
    const fn new() -> Self {
        Self {
            done: Note::new(),
            active_ch: AtomicU8::new(NO_CHANNEL),
            irq_slot: AtomicU8::new(0),
        }
    }
}

/// Finds the smallest even prescale and largest post-divide that bring the
/// output clock at or below the requested baudrate.
fn clock_divisors(baudrate: u32, freq_in: u32) -> (u8, u8) {
    let mut prescale = u8::MAX;
    for prescale_option in (2u32..=254).step_by(2) {
        // Invalid prescale candidates can overflow at high baudrates;
        // saturating at u32::MAX keeps the comparison meaningful because
        // those candidates exceed any possible input clock.
        if freq_in < ((prescale_option + 2) * 256).saturating_mul(baudrate) {
            prescale = prescale_option as u8;
            break;
        }
    }
    debug_assert_ne!(prescale, u8::MAX);

    let mut postdiv = 0u8;
    for postdiv_option in (1..=255u8).rev() {
        if freq_in / (prescale as u32 * postdiv_option as u32) > baudrate {
            postdiv = postdiv_option;
            break;
        }
    }
    (prescale, postdiv)
}

/// SPI peripheral operating in master mode.
pub struct SpiMaster<D: SpiDevice> {
    spi: D,
    tx_dma: Option<DmaChannel>,
    rx_dma: Option<DmaChannel>,
    irq_slot: usize,
    rdirty: bool,
}

impl<D: SpiDevice> SpiMaster<D> {
    /// Returns a new master-mode driver for the peripheral. Valid DMA
    /// channels, if given, are used for bigger transfers in the respective
    /// direction.
    pub fn new(spi: D, tx_dma: Option<DmaChannel>, rx_dma: Option<DmaChannel>) -> Self {
        let irq_slot = crate::core_id() as usize;
        D::state().irq_slot.store(irq_slot as u8, Ordering::Relaxed);
        Self {
            spi,
            tx_dma,
            rx_dma,
            irq_slot,
            rdirty: false,
        }
    }

    /// Resets the peripheral, configures Motorola frame format with 8-bit
    /// words in the given mode, programs the closest reachable baudrate and
    /// enables the peripheral. Returns the actual baudrate.
    pub fn setup(
        &mut self,
        mode: Mode,
        baudrate: HertzU32,
        resets: &mut pac::RESETS,
        system_clock: HertzU32,
    ) -> HertzU32 {
        self.spi.reset_bring_down(resets);
        self.spi.reset_bring_up(resets);

        let freq_in = system_clock.to_Hz();
        let (prescale, postdiv) = clock_divisors(baudrate.to_Hz(), freq_in);
        self.spi
            .sspcpsr()
            .write(|w| unsafe { w.cpsdvsr().bits(prescale) });
        self.spi.sspcr0().write(|w| {
            unsafe {
                w.dss().bits(7); // 8 bit frames
                w.scr().bits(postdiv);
            }
            w.spo()
                .bit(mode.polarity == Polarity::IdleHigh);
            w.sph()
                .bit(mode.phase == Phase::CaptureOnSecondTransition)
        });

        // Handshake enabled on the peripheral side; gated per transfer by
        // the channel configuration on the DMA side.
        self.spi.sspdmacr().write(|w| {
            w.txdmae().set_bit();
            w.rxdmae().set_bit()
        });

        self.enable();
        HertzU32::from_raw(freq_in / (prescale as u32 * (1 + postdiv as u32)))
    }

    /// Releases the peripheral and the borrowed DMA channels.
    pub fn free(self, resets: &mut pac::RESETS) -> (D, Option<DmaChannel>, Option<DmaChannel>) {
        self.spi.reset_bring_down(resets);
        (self.spi, self.tx_dma, self.rx_dma)
    }

    /// Enables the peripheral.
    pub fn enable(&mut self) {
        self.spi.sspcr1().modify(|_, w| w.sse().set_bit());
    }

    /// Waits for the last bit of the last transfer to go out, then disables
    /// the peripheral.
    pub fn disable(&mut self) {
        self.wait_tx_done();
        self.spi.sspcr1().modify(|_, w| w.sse().clear_bit());
    }

    /// Waits until the Tx FIFO is empty and the shift register idle.
    /// Idempotent.
    pub fn wait_tx_done(&mut self) {
        let regs = D::regs();
        loop {
            let sr = regs.sspsr().read();
            if sr.tfe().bit_is_set() && sr.bsy().bit_is_clear() {
                break;
            }
            arch::nop();
        }
    }

    /// Writes `data`, ignoring whatever the bus clocks back in. Returns when
    /// everything is at least in the FIFO (polling path) or fully
    /// transferred (DMA path).
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if data.len() < MIN_DMA || self.tx_dma.is_none() {
            self.write_poll(data);
        } else {
            self.write_dma(data);
        }
        // We left unread garbage in the Rx FIFO.
        self.rdirty = true;
    }

    fn write_poll(&mut self, data: &[u8]) {
        let regs = D::regs();
        let mut i = 0;
        // Burst-fill while the FIFO is known empty.
        if regs.sspsr().read().tfe().bit_is_set() {
            i = min(FIFO_DEPTH, data.len());
            for &b in &data[..i] {
                regs.sspdr().write(|w| unsafe { w.data().bits(b as u16) });
            }
        }
        // Check-before-every-store path.
        while i < data.len() {
            while regs.sspsr().read().tnf().bit_is_clear() {
                arch::nop();
            }
            regs.sspdr().write(|w| unsafe { w.data().bits(data[i] as u16) });
            i += 1;
        }
    }

    fn write_dma(&mut self, data: &[u8]) {
        let Some(ch) = self.tx_dma.as_ref() else {
            return;
        };
        let regs = D::regs();
        let st = D::state();
        st.active_ch.store(ch.id(), Ordering::Relaxed);
        ch.check_and_clear_irq(self.irq_slot);
        ch.set_read_addr(data.as_ptr() as u32);
        ch.set_write_addr(regs.sspdr().as_ptr() as u32);
        ch.set_trans_count(data.len() as u32);
        ch.set_config_trig(DmaConfig::new(D::tx_treq()).incr_read());
        ch.enable_irq(self.irq_slot);
        st.done.wait();
        st.done.clear();
        st.active_ch.store(NO_CHANNEL, Ordering::Relaxed);
    }

    /// Switches between 8-bit (the default) and 16-bit frames after waiting
    /// out the transfer in progress.
    pub fn set_frame_16bit(&mut self, enable: bool) {
        self.wait_tx_done();
        self.spi
            .sspcr0()
            .modify(|_, w| unsafe { w.dss().bits(if enable { 15 } else { 7 }) });
    }

    /// Like [`SpiMaster::write`] for 16-bit frames. Switch the frame size
    /// with [`SpiMaster::set_frame_16bit`] first.
    pub fn write16(&mut self, data: &[u16]) {
        if data.is_empty() {
            return;
        }
        let regs = D::regs();
        let mut i = 0;
        if regs.sspsr().read().tfe().bit_is_set() {
            i = min(FIFO_DEPTH, data.len());
            for &word in &data[..i] {
                regs.sspdr().write(|w| unsafe { w.data().bits(word) });
            }
        }
        while i < data.len() {
            while regs.sspsr().read().tnf().bit_is_clear() {
                arch::nop();
            }
            regs.sspdr().write(|w| unsafe { w.data().bits(data[i]) });
            i += 1;
        }
        self.rdirty = true;
    }

    /// Pops leftover write garbage until the bus goes quiet.
    fn drain_rx(&mut self) {
        let regs = D::regs();
        loop {
            while regs.sspsr().read().rne().bit_is_set() {
                let _ = regs.sspdr().read();
            }
            if regs.sspsr().read().bsy().bit_is_clear() {
                break;
            }
            arch::nop();
        }
        self.rdirty = false;
    }

    /// Reads `buf.len()` bytes, clocking `fill` out for each one.
    pub fn read(&mut self, buf: &mut [u8], fill: u8) {
        if buf.is_empty() {
            return;
        }
        if self.rdirty {
            self.drain_rx();
        }
        if buf.len() < MIN_DMA || self.rx_dma.is_none() {
            self.duplex(buf, &[], fill);
        } else {
            self.read_dma(buf, fill);
        }
    }

    fn read_dma(&mut self, buf: &mut [u8], fill: u8) {
        let Some(ch) = self.rx_dma.as_ref() else {
            return;
        };
        let regs = D::regs();
        let st = D::state();
        st.active_ch.store(ch.id(), Ordering::Relaxed);
        ch.check_and_clear_irq(self.irq_slot);
        ch.set_read_addr(regs.sspdr().as_ptr() as u32);
        ch.set_write_addr(buf.as_mut_ptr() as u32);
        ch.set_trans_count(buf.len() as u32);
        ch.set_config_trig(DmaConfig::new(D::rx_treq()).incr_write());
        ch.enable_irq(self.irq_slot);
        // Feed the clock from this thread while the channel drains the
        // FIFO. The Rx side cannot overrun: the channel empties it at bus
        // speed and the Tx FIFO bounds what is in flight.
        for _ in 0..buf.len() {
            while regs.sspsr().read().tnf().bit_is_clear() {
                arch::nop();
            }
            regs.sspdr().write(|w| unsafe { w.data().bits(fill as u16) });
        }
        st.done.wait();
        st.done.clear();
        st.active_ch.store(NO_CHANNEL, Ordering::Relaxed);
    }

    /// Full-duplex polling loop: clocks `max(rx, tx)` words, padding the
    /// tail of `tx` with `fill` and discarding words beyond `rx`. The
    /// in-flight window is capped by the FIFO depth so the Rx side never
    /// overruns.
    fn duplex(&mut self, rx: &mut [u8], tx: &[u8], fill: u8) {
        let regs = D::regs();
        let total = max(rx.len(), tx.len());
        let mut sent = 0;
        let mut recvd = 0;
        while recvd < total {
            while sent < total
                && sent - recvd < FIFO_DEPTH
                && regs.sspsr().read().tnf().bit_is_set()
            {
                let b = if sent < tx.len() { tx[sent] } else { fill };
                regs.sspdr().write(|w| unsafe { w.data().bits(b as u16) });
                sent += 1;
            }
            while recvd < sent && regs.sspsr().read().rne().bit_is_set() {
                let b = regs.sspdr().read().data().bits() as u8;
                if recvd < rx.len() {
                    rx[recvd] = b;
                }
                recvd += 1;
            }
        }
    }

    /// Completion handler for the borrowed DMA channels. Bind it to the
    /// DMA_IRQ_n line the driver was constructed on; it is a no-op when the
    /// pending interrupt belongs to another channel.
    pub fn on_dma_interrupt() {
        let st = D::state();
        let ch = st.active_ch.load(Ordering::Relaxed);
        if ch == NO_CHANNEL {
            return;
        }
        let slot = st.irq_slot.load(Ordering::Relaxed) as usize;
        if !dma::raw_check_and_clear_irq(ch, slot) {
            return;
        }
        dma::raw_disable_irq(ch, slot);
        st.done.wake();
    }
}

impl<D: SpiDevice> embedded_hal::spi::ErrorType for SpiMaster<D> {
    type Error = Infallible;
}

impl<D: SpiDevice> embedded_hal::spi::SpiBus<u8> for SpiMaster<D> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        SpiMaster::read(self, words, 0);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        SpiMaster::write(self, words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        if self.rdirty {
            self.drain_rx();
        }
        self.duplex(read, write, 0);
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        if self.rdirty {
            self.drain_rx();
        }
        let regs = D::regs();
        let mut sent = 0;
        let mut recvd = 0;
        // Same windowed loop as `duplex`; `recvd` trails `sent`, so a slot
        // is only overwritten after its original byte went out.
        while recvd < words.len() {
            while sent < words.len()
                && sent - recvd < FIFO_DEPTH
                && regs.sspsr().read().tnf().bit_is_set()
            {
                regs.sspdr()
                    .write(|w| unsafe { w.data().bits(words[sent] as u16) });
                sent += 1;
            }
            while recvd < sent && regs.sspsr().read().rne().bit_is_set() {
                words[recvd] = regs.sspdr().read().data().bits() as u8;
                recvd += 1;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        self.wait_tx_done();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_divisors_1mhz_at_125mhz() {
        let (prescale, postdiv) = clock_divisors(1_000_000, 125_000_000);
        assert_eq!((prescale, postdiv), (2, 62));
        // 125 MHz / (2 * 63) ≈ 992 kHz, the closest rate not above 1 MHz.
        assert_eq!(125_000_000 / (prescale as u32 * (1 + postdiv as u32)), 992_063);
    }

    #[test]
    fn clock_divisors_max_rate() {
        // Half the input clock is the fastest the PL022 can do.
        let (prescale, postdiv) = clock_divisors(62_500_000, 125_000_000);
        assert_eq!((prescale, postdiv), (2, 0));
    }
}
