//! Direct memory access (DMA)
//!
//! The RP2350 provides a single DMA controller with 16 functionally
//! interchangeable channels. Because the channels are interchangeable this
//! module does not hand out specific channels; instead [`DmaPool`] lends out
//! whichever channel is free and reclaims it when the [`DmaChannel`] handle
//! is dropped.
//!
//! Drivers that want DMA offload for large transfers borrow a channel at
//! construction time:
//!
//! ```no_run
//! use rp235x_async_drivers::{dma::DmaPool, i2c::I2cMaster};
//!
//! let mut pac = rp235x_pac::Peripherals::take().unwrap();
//! let dma = DmaPool::new(pac.DMA, &mut pac.RESETS);
//! let mut i2c = I2cMaster::new(pac.I2C0, dma.alloc());
//! ```
//!
//! A driver constructed without a channel silently falls back to
//! interrupt-only operation.

use core::sync::atomic::{AtomicU16, Ordering};

use embedded_dma::{ReadBuffer, WriteBuffer};

use crate::atomic_register_access::{write_bitmask_clear, write_bitmask_set};
use crate::pac;
use crate::resets::SubsystemReset;

/// Number of channels the DMA controller provides.
pub const NUM_CHANNELS: usize = 16;

/// Number of DMA interrupt lines (DMA_IRQ_0 ..= DMA_IRQ_3).
pub const NUM_IRQ_LINES: usize = 4;

/// "No channel bound" marker used in the drivers' interrupt-visible state.
pub(crate) const NO_CHANNEL: u8 = u8::MAX;

/// Free-channel bitmask shared by every [`DmaPool`] user, 1 = free.
///
/// All bits start cleared, so allocation fails until [`DmaPool::new`] has
/// brought the controller out of reset and seeded the mask.
static POOL_FREE: ChannelMask = ChannelMask::new(0);

/// The DMA channel pool.
///
/// Owning the `pac::DMA` singleton guarantees the one-time hardware bring-up
/// in [`DmaPool::new`] runs exactly once.
pub struct DmaPool {
    _dma: pac::DMA,
}

impl DmaPool {
    /// Takes the DMA controller out of reset and makes all 16 channels
    /// available for allocation.
    pub fn new(dma: pac::DMA, resets: &mut pac::RESETS) -> Self {
        dma.reset_bring_down(resets);
        dma.reset_bring_up(resets);
        POOL_FREE.0.store(0xffff, Ordering::Release);
        Self { _dma: dma }
    }

    /// Allocates a free channel, or `None` if all 16 are in use.
    ///
    /// The channel returns to the pool when the handle is dropped.
    pub fn alloc(&self) -> Option<DmaChannel> {
        POOL_FREE.alloc().map(|id| DmaChannel { id })
    }
}

/// Lock-free bitmask of free channels.
struct ChannelMask(AtomicU16);

impl ChannelMask {
    const fn new(bits: u16) -> Self {
        Self(AtomicU16::new(bits))
    }

    /// Claims the lowest free channel index.
    fn alloc(&self) -> Option<u8> {
        let mut mask = self.0.load(Ordering::Relaxed);
        loop {
            if mask == 0 {
                return None;
            }
            let id = mask.trailing_zeros() as u8;
            match self.0.compare_exchange_weak(
                mask,
                mask & !(1 << id),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(id),
                Err(m) => mask = m,
            }
        }
    }

    fn free(&self, id: u8) {
        let prev = self.0.fetch_or(1 << id, Ordering::AcqRel);
        debug_assert!(prev & (1 << id) == 0, "DMA channel freed twice");
    }
}

/// Exclusive handle to one DMA channel.
///
/// The handle's existence is its validity: it can only be obtained from
/// [`DmaPool::alloc`] and no two live handles ever share an index.
pub struct DmaChannel {
    id: u8,
}

impl Drop for DmaChannel {
    fn drop(&mut self) {
        POOL_FREE.free(self.id);
    }
}

/// Bus transfer width of a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSize {
    /// 8-bit transfers
    Byte = 0,
    /// 16-bit transfers
    HalfWord = 1,
    /// 32-bit transfers
    Word = 2,
}

/// Transfer request signal that paces a channel (see the TREQ_SEL table in
/// the datasheet). `TREQ_UNPACED` runs as fast as the bus allows.
pub const TREQ_UNPACED: u8 = 0x3f;

/// Channel control configuration.
///
/// Built by the drivers from the pac's `TREQ_SEL_A` values; `en` is always
/// set when the configuration is written.
#[derive(Debug, Clone, Copy)]
pub struct DmaConfig {
    treq: u8,
    data_size: DataSize,
    incr_read: bool,
    incr_write: bool,
    high_priority: bool,
}

impl DmaConfig {
    /// A byte-wide configuration paced by `treq`, with both addresses fixed.
    pub const fn new(treq: u8) -> Self {
        Self {
            treq,
            data_size: DataSize::Byte,
            incr_read: false,
            incr_write: false,
            high_priority: false,
        }
    }

    /// Sets the per-transfer bus width.
    pub const fn data_size(mut self, size: DataSize) -> Self {
        self.data_size = size;
        self
    }

    /// Increment the read address after each transfer (memory source).
    pub const fn incr_read(mut self) -> Self {
        self.incr_read = true;
        self
    }

    /// Increment the write address after each transfer (memory sink).
    pub const fn incr_write(mut self) -> Self {
        self.incr_write = true;
        self
    }

    /// Preferential treatment in issue scheduling.
    pub const fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }
}

fn dma_regs() -> &'static pac::dma::RegisterBlock {
    unsafe { &*pac::DMA::ptr() }
}

/// INTE register for one of the 4 interrupt lines.
fn inte_ptr(slot: usize) -> *mut u32 {
    let dma = dma_regs();
    match slot & 3 {
        0 => dma.inte0().as_ptr(),
        1 => dma.inte1().as_ptr(),
        2 => dma.inte2().as_ptr(),
        _ => dma.inte3().as_ptr(),
    }
}

pub(crate) fn raw_enable_irq(id: u8, slot: usize) {
    // Safety: we only use the atomic alias of the register.
    unsafe { write_bitmask_set(inte_ptr(slot), 1 << id) }
}

pub(crate) fn raw_disable_irq(id: u8, slot: usize) {
    // Safety: we only use the atomic alias of the register.
    unsafe { write_bitmask_clear(inte_ptr(slot), 1 << id) }
}

/// Checks whether channel `id` has an interrupt pending on `slot` and clears
/// it. Race-free: only the bit for this channel is ever written.
pub(crate) fn raw_check_and_clear_irq(id: u8, slot: usize) -> bool {
    let dma = dma_regs();
    let bit = 1u32 << id;
    let pending = match slot & 3 {
        0 => {
            let p = dma.ints0().read().bits() & bit != 0;
            if p {
                dma.ints0().write(|w| unsafe { w.bits(bit) });
            }
            p
        }
        1 => {
            let p = dma.ints1().read().bits() & bit != 0;
            if p {
                dma.ints1().write(|w| unsafe { w.bits(bit) });
            }
            p
        }
        2 => {
            let p = dma.ints2().read().bits() & bit != 0;
            if p {
                dma.ints2().write(|w| unsafe { w.bits(bit) });
            }
            p
        }
        _ => {
            let p = dma.ints3().read().bits() & bit != 0;
            if p {
                dma.ints3().write(|w| unsafe { w.bits(bit) });
            }
            p
        }
    };
    pending
}

pub(crate) fn raw_abort(id: u8) {
    let dma = dma_regs();
    dma.chan_abort().write(|w| unsafe { w.bits(1 << id) });
    while dma.ch(id as usize).ch_ctrl_trig().read().busy().bit_is_set() {}
}

impl DmaChannel {
    /// Index of this channel (0..16).
    pub fn id(&self) -> u8 {
        self.id
    }

    fn regs(&self) -> &pac::dma::CH {
        dma_regs().ch(self.id as usize)
    }

    /// Programs the source address. Does not trigger.
    pub fn set_read_addr(&self, addr: u32) {
        self.regs().ch_read_addr().write(|w| unsafe { w.bits(addr) });
    }

    /// Programs the destination address. Does not trigger.
    pub fn set_write_addr(&self, addr: u32) {
        self.regs().ch_write_addr().write(|w| unsafe { w.bits(addr) });
    }

    /// Programs the number of transfers for the next trigger (normal,
    /// single-shot reload mode). Does not trigger.
    pub fn set_trans_count(&self, count: u32) {
        // Bits 31:28 select the reload mode; 0 is TRANS_COUNT_MODE_NORMAL.
        self.regs()
            .ch_trans_count()
            .write(|w| unsafe { w.bits(count & 0x0fff_ffff) });
    }

    /// Writes the channel control register without triggering.
    pub fn set_config(&self, cfg: DmaConfig) {
        self.regs().ch_al1_ctrl().write(|w| {
            unsafe {
                w.data_size().bits(cfg.data_size as u8);
                w.treq_sel().bits(cfg.treq);
                // Chaining to itself disables chaining.
                w.chain_to().bits(self.id);
            }
            w.incr_read().bit(cfg.incr_read);
            w.incr_write().bit(cfg.incr_write);
            w.high_priority().bit(cfg.high_priority);
            w.en().set_bit();
            w
        });
    }

    /// Writes the channel control register and starts the transfer.
    pub fn set_config_trig(&self, cfg: DmaConfig) {
        self.regs().ch_ctrl_trig().write(|w| {
            unsafe {
                w.data_size().bits(cfg.data_size as u8);
                w.treq_sel().bits(cfg.treq);
                // Chaining to itself disables chaining.
                w.chain_to().bits(self.id);
            }
            w.incr_read().bit(cfg.incr_read);
            w.incr_write().bit(cfg.incr_write);
            w.high_priority().bit(cfg.high_priority);
            w.en().set_bit();
            w
        });
    }

    /// Starts a previously configured transfer.
    pub fn start(&self) {
        // Safety: the write only affects this channel.
        dma_regs()
            .multi_chan_trigger()
            .write(|w| unsafe { w.bits(1 << self.id) });
    }

    /// Whether the channel is transferring data.
    pub fn busy(&self) -> bool {
        self.regs().ch_ctrl_trig().read().busy().bit_is_set()
    }

    /// Stops the channel and waits for it to go idle.
    ///
    /// In-flight bus transfers complete; the transfer count of the aborted
    /// transfer is lost.
    pub fn abort(&self) {
        raw_abort(self.id);
    }

    /// Routes this channel's completion interrupt to the DMA_IRQ_`slot`
    /// line (0..=3).
    pub fn enable_irq(&self, slot: usize) {
        raw_enable_irq(self.id, slot);
    }

    /// Removes this channel from the DMA_IRQ_`slot` line.
    pub fn disable_irq(&self, slot: usize) {
        raw_disable_irq(self.id, slot);
    }

    /// Checks for and clears a pending completion interrupt on `slot`.
    pub fn check_and_clear_irq(&self, slot: usize) -> bool {
        raw_check_and_clear_irq(self.id, slot)
    }
}

/// An in-flight one-shot transfer between memory and a peripheral data
/// register, holding the channel and the buffer until completion.
pub struct Transfer<B> {
    ch: DmaChannel,
    buf: B,
}

impl<B> Transfer<B> {
    /// Whether the transfer has finished.
    pub fn is_done(&self) -> bool {
        !self.ch.busy()
    }

    /// Busy-waits for completion and returns the channel and buffer.
    pub fn wait(self) -> (DmaChannel, B) {
        while self.ch.busy() {
            crate::arch::nop();
        }
        (self.ch, self.buf)
    }
}

impl DmaChannel {
    /// Starts copying `buf` into a peripheral data register, paced by `treq`.
    ///
    /// The buffer and channel are held by the returned [`Transfer`] until
    /// [`Transfer::wait`] hands them back.
    pub fn write_peripheral<B>(self, buf: B, dst: *mut u32, treq: u8) -> Transfer<B>
    where
        B: ReadBuffer<Word = u8>,
    {
        let (ptr, len) = unsafe { buf.read_buffer() };
        self.set_read_addr(ptr as u32);
        self.set_write_addr(dst as u32);
        self.set_trans_count(len as u32);
        self.set_config_trig(DmaConfig::new(treq).incr_read());
        Transfer { ch: self, buf }
    }

    /// Starts filling `buf` from a peripheral data register, paced by `treq`.
    pub fn read_peripheral<B>(self, mut buf: B, src: *const u32, treq: u8) -> Transfer<B>
    where
        B: WriteBuffer<Word = u8>,
    {
        let (ptr, len) = unsafe { buf.write_buffer() };
        self.set_read_addr(src as u32);
        self.set_write_addr(ptr as u32);
        self.set_trans_count(len as u32);
        self.set_config_trig(DmaConfig::new(treq).incr_write());
        Transfer { ch: self, buf }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_mutually_exclusive() {
        let mask = ChannelMask::new(0xffff);
        let mut seen = [false; NUM_CHANNELS];
        for _ in 0..NUM_CHANNELS {
            let id = mask.alloc().unwrap() as usize;
            assert!(!seen[id], "channel {} handed out twice", id);
            seen[id] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let mask = ChannelMask::new(0xffff);
        for _ in 0..NUM_CHANNELS {
            assert!(mask.alloc().is_some());
        }
        assert_eq!(mask.alloc(), None);
        // Freeing one channel makes exactly one more allocation succeed.
        mask.free(5);
        assert_eq!(mask.alloc(), Some(5));
        assert_eq!(mask.alloc(), None);
    }

    #[test]
    fn alloc_prefers_lowest_index() {
        let mask = ChannelMask::new(0b1010_0000);
        assert_eq!(mask.alloc(), Some(5));
        assert_eq!(mask.alloc(), Some(7));
        assert_eq!(mask.alloc(), None);
    }

    #[test]
    fn uninitialized_pool_is_empty() {
        let mask = ChannelMask::new(0);
        assert_eq!(mask.alloc(), None);
    }
}
