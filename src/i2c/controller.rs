use core::cmp::min;
use core::sync::atomic::Ordering;

use embedded_hal::i2c as eh1;
use fugit::HertzU32;

use crate::arch;
use crate::atomic_register_access::write_bitmask_set;
use crate::dma::{self, DmaChannel, DmaConfig};
use crate::pac;
use crate::resets::SubsystemReset;

use super::{
    push_cmds, CmdWord, Error, I2cDevice, I2cMaster, Status, ValidAddress, ABRT_FLAGS,
    ABRT_USER_ABRT, NO_DMA,
};

/// Transfers at or above this size go through DMA when a channel is bound;
/// below it the interrupt overhead is cheaper than programming the channel.
const MIN_DMA: usize = 16;

/// IC_ENABLE.ABORT
const ENABLE_ABORT: u32 = 1 << 1;

fn abort_latched(regs: &pac::i2c0::RegisterBlock) -> bool {
    regs.ic_tx_abrt_source().read().bits() & ABRT_FLAGS != 0
}

/// FAST-mode SCL timing, straight from the pico-sdk calculations.
fn scl_timing(freq: u32, freq_in: u32) -> (u16, u16, u8, u16) {
    let period = (freq_in + freq / 2) / freq;
    let lcnt = period * 3 / 5; // spend 3/5 (60%) of the period low
    let hcnt = period - lcnt; // and 2/5 (40%) of the period high

    assert!(hcnt <= 0xffff);
    assert!(lcnt <= 0xffff);
    assert!(hcnt >= 8);
    assert!(lcnt >= 8);

    // Per I2C-bus specification a device in standard or fast mode must
    // internally provide a hold time of at least 300ns for the SDA signal to
    // bridge the undefined region of the falling edge of SCL. A smaller hold
    // time of 120ns is used for fast mode plus.
    let sda_tx_hold_count = if freq < 1_000_000 {
        ((freq_in * 3) / 10_000_000) + 1
    } else {
        ((freq_in * 3) / 25_000_000) + 1
    };
    assert!(sda_tx_hold_count <= lcnt - 2);

    let spklen = if lcnt < 16 { 1 } else { (lcnt / 16) as u8 };
    (hcnt as u16, lcnt as u16, spklen, sda_tx_hold_count as u16)
}

impl<D: I2cDevice> I2cMaster<D> {
    /// Returns a new master-mode driver for the peripheral. If a DMA channel
    /// is given it is used for bigger data transfers; without one the driver
    /// runs interrupt-only.
    ///
    /// Call [`I2cMaster::setup`] before use and bind
    /// [`I2cMaster::on_interrupt`] to the peripheral's interrupt (plus
    /// [`I2cMaster::on_dma_interrupt`] to the matching DMA_IRQ_n line when a
    /// channel is bound; `n` is the index of the core calling `new`).
    pub fn new(i2c: D, dma: Option<DmaChannel>) -> Self {
        let dma_irq = crate::core_id() as usize;
        let st = D::state();
        st.dma_ch.store(
            dma.as_ref().map_or(NO_DMA, |ch| ch.id()),
            Ordering::Relaxed,
        );
        st.dma_irq.store(dma_irq as u8, Ordering::Relaxed);
        Self { i2c, dma, dma_irq }
    }

    /// Resets and configures the peripheral for master mode at the given bus
    /// frequency (fast mode, like the pico-sdk).
    ///
    /// The peripheral stays disabled until [`I2cMaster::set_addr`] selects a
    /// target.
    pub fn setup(&mut self, freq: HertzU32, resets: &mut pac::RESETS, system_clock: HertzU32) {
        let freq = freq.to_Hz();
        assert!(freq <= 1_000_000);
        assert!(freq > 0);

        self.i2c.reset_bring_down(resets);
        self.i2c.reset_bring_up(resets);

        unsafe {
            self.i2c.ic_intr_mask().write_with_zero(|w| w);
        }

        self.i2c.ic_con().write(|w| {
            w.speed().fast();
            w.master_mode().enabled();
            w.ic_slave_disable().slave_disabled();
            w.ic_restart_en().enabled();
            w.tx_empty_ctrl().enabled();
            w.rx_fifo_full_hld_ctrl().enabled()
        });

        // Handshake enabled on the peripheral side; gated per transfer by
        // the channel configuration on the DMA side.
        self.i2c.ic_dma_cr().write(|w| {
            w.tdmae().enabled();
            w.rdmae().enabled()
        });

        // Clear FIFO thresholds; the read path adjusts RX_TL per transfer.
        self.i2c.ic_tx_tl().write(|w| unsafe { w.tx_tl().bits(0) });
        self.i2c.ic_rx_tl().write(|w| unsafe { w.rx_tl().bits(0) });

        let (hcnt, lcnt, spklen, sda_tx_hold) = scl_timing(freq, system_clock.to_Hz());
        unsafe {
            self.i2c.ic_fs_scl_hcnt().write(|w| w.ic_fs_scl_hcnt().bits(hcnt));
            self.i2c.ic_fs_scl_lcnt().write(|w| w.ic_fs_scl_lcnt().bits(lcnt));
            self.i2c.ic_fs_spklen().write(|w| w.ic_fs_spklen().bits(spklen));
            self.i2c
                .ic_sda_hold()
                .modify(|_r, w| w.ic_sda_tx_hold().bits(sda_tx_hold));
        }
    }

    /// Releases the peripheral and the borrowed DMA channel.
    pub fn free(self, resets: &mut pac::RESETS) -> (D, Option<DmaChannel>) {
        self.i2c.reset_bring_down(resets);
        D::state().dma_ch.store(NO_DMA, Ordering::Relaxed);
        (self.i2c, self.dma)
    }

    /// Sets the address of the target device and enables the peripheral.
    ///
    /// You must ensure no command intended for the previous address is still
    /// pending in the Tx FIFO (one that causes a START or RESTART); changing
    /// the address mid-transaction corrupts the transaction in progress.
    pub fn set_addr<A: ValidAddress>(&mut self, addr: A) -> Result<(), Error> {
        addr.is_valid()?;
        self.i2c.ic_enable().write(|w| w.enable().disabled());
        self.i2c
            .ic_con()
            .modify(|_, w| w.ic_10bitaddr_master().variant(A::BIT_ADDR_M));
        self.i2c
            .ic_tar()
            .write(|w| unsafe { w.ic_tar().bits(addr.into()) });
        self.i2c.ic_enable().write(|w| w.enable().enabled());
        Ok(())
    }

    /// Waits until all commands/data passed to the driver have been consumed,
    /// making the previous write operation synchronous. You must call `flush`
    /// (or issue the next write, which flushes first) before the buffer
    /// passed to the previous write may be reused.
    ///
    /// Idempotent: with no write outstanding it returns immediately. Return
    /// from `flush` does not mean the data reached the bus; there may be a
    /// full Tx FIFO still to transmit, see [`I2cMaster::wait`].
    pub fn flush(&mut self) {
        let st = D::state();
        if !st.wdata.load(Ordering::Acquire).is_null() {
            st.wdone.wait();
            st.wdone.clear();
            st.wdata.store(core::ptr::null_mut(), Ordering::Relaxed);
        }
    }

    /// Thread-mode fast path + ISR handoff shared by the write entry points.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+n` (bytes, or `CmdWord`s when `is_cmd`) must stay valid and
    /// untouched until [`I2cMaster::flush`] returns.
    unsafe fn start_write_raw(&mut self, ptr: *mut u8, n: usize, is_cmd: bool) {
        let regs = D::regs();
        if abort_latched(regs) {
            return;
        }
        // Fill the FIFO in thread mode first. TFNF is re-checked on every
        // iteration: this code can be preempted at any point, so a FIFO
        // level read once would go stale.
        let mut i = 0;
        if !is_cmd {
            let data = unsafe { core::slice::from_raw_parts(ptr as *const u8, n) };
            while regs.ic_status().read().tfnf().bit_is_set() {
                regs.ic_data_cmd()
                    .write(|w| unsafe { w.bits(data[i] as u32) });
                i += 1;
                if i == n {
                    return;
                }
            }
        } else {
            let cmds = unsafe { core::slice::from_raw_parts_mut(ptr as *mut CmdWord, n) };
            i = push_cmds(
                cmds,
                0,
                || regs.ic_status().read().tfnf().bit_is_set(),
                |bits| regs.ic_data_cmd().write(|w| unsafe { w.bits(bits) }),
            );
            if i == n {
                return;
            }
        }
        // The interrupt handler feeds the rest. Descriptor fields first,
        // count with release ordering, interrupt mask strictly last.
        let st = D::state();
        st.wcmd.store(is_cmd, Ordering::Relaxed);
        st.wi.store(i, Ordering::Relaxed);
        st.wdata.store(ptr, Ordering::Relaxed);
        st.wn.store(n as i32, Ordering::Release);
        unsafe {
            write_bitmask_set(
                regs.ic_intr_mask().as_ptr(),
                (Status::TX_EMPTY | Status::TX_ABRT).bits(),
            );
        }
    }

    /// DMA escape for plain byte writes.
    unsafe fn start_write_dma(&self, ptr: *const u8, n: usize) {
        let Some(ch) = self.dma.as_ref() else { return };
        let regs = D::regs();
        if abort_latched(regs) {
            return;
        }
        let st = D::state();
        // Keeps Flush working and marks the write side DMA-busy.
        st.wdata.store(ptr as *mut u8, Ordering::Relaxed);
        st.wn.store(-1, Ordering::Release);
        ch.check_and_clear_irq(self.dma_irq);
        ch.set_read_addr(ptr as u32);
        ch.set_write_addr(regs.ic_data_cmd().as_ptr() as u32);
        ch.set_trans_count(n as u32);
        ch.set_config_trig(DmaConfig::new(D::tx_treq()).incr_read());
        ch.enable_irq(self.dma_irq);
        unsafe {
            write_bitmask_set(regs.ic_intr_mask().as_ptr(), Status::TX_ABRT.bits());
        }
    }

    /// Starts writing command words into the Tx FIFO in the background using
    /// interrupts. No-op for an empty slice.
    ///
    /// Asynchronous: may return with part of the stream still unconsumed.
    /// Multi-byte `Recv` words are rewritten in place as they are consumed.
    ///
    /// # Safety
    ///
    /// `cmds` must not be moved, mutated, dropped or otherwise reused until
    /// [`I2cMaster::flush`] (or the next write method, which flushes first)
    /// returns. [`I2cMaster::transfer`] is the safe wrapper.
    pub unsafe fn write_cmds(&mut self, cmds: &mut [CmdWord]) {
        if cmds.is_empty() {
            return;
        }
        self.flush();
        unsafe { self.start_write_raw(cmds.as_mut_ptr() as *mut u8, cmds.len(), true) }
    }

    /// Like [`I2cMaster::write_cmds`] but writes a single command word from
    /// an internal scratch slot, so it is safe.
    pub fn write_cmd(&mut self, cmd: CmdWord) {
        self.flush();
        let st = D::state();
        unsafe {
            st.wbuf.get().write(cmd);
            self.start_write_raw(st.wbuf.get() as *mut u8, 1, true);
        }
    }

    /// Starts writing data bytes (all-Send, no STOP) into the Tx FIFO in the
    /// background using interrupts and/or DMA. No-op for an empty slice.
    ///
    /// Byte writes carry no framing flags; a clean STOP comes from a
    /// trailing command word or from [`I2cMaster::abort`].
    ///
    /// # Safety
    ///
    /// `data` must not be moved, mutated, dropped or otherwise reused until
    /// [`I2cMaster::flush`] (or the next write method) returns.
    pub unsafe fn write_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.flush();
        if data.len() < MIN_DMA || self.dma.is_none() {
            unsafe { self.start_write_raw(data.as_ptr() as *mut u8, data.len(), false) }
        } else {
            unsafe { self.start_write_dma(data.as_ptr(), data.len()) }
        }
    }

    /// Reads `buf.len()` data bytes from the Rx FIFO. Returns when the
    /// buffer is full or the transaction aborted; the data read so far is
    /// valid if [`I2cMaster::err`] returns `None`.
    ///
    /// The bytes must have been asked for with `Recv` command words. One
    /// `Recv` covers at most 256 bytes; longer reads are split by the caller
    /// at the command level.
    pub fn read_bytes(&mut self, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        if buf.len() < MIN_DMA || self.dma.is_none() {
            self.read_raw(buf);
        } else {
            self.read_dma(buf);
        }
    }

    /// Reads a single byte from the Rx FIFO.
    pub fn read_byte(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.read_raw(&mut b);
        b[0]
    }

    fn read_raw(&mut self, buf: &mut [u8]) {
        let regs = D::regs();
        if abort_latched(regs) {
            return;
        }
        // Drain in thread mode first; RFNE re-checked per iteration for the
        // same reason the write path re-checks TFNF.
        let n = buf.len();
        let mut i = 0;
        while regs.ic_status().read().rfne().bit_is_set() {
            buf[i] = regs.ic_data_cmd().read().dat().bits();
            i += 1;
            if i == n {
                return;
            }
        }
        // The interrupt handler reads the rest.
        let st = D::state();
        st.ri.store(i, Ordering::Relaxed);
        st.rdata.store(buf.as_mut_ptr(), Ordering::Relaxed);
        regs.ic_rx_tl()
            .write(|w| unsafe { w.rx_tl().bits(min(n - i, Self::RX_FIFO_DEPTH) as u8 - 1) });
        st.rn.store(n as i32, Ordering::Release);
        unsafe {
            write_bitmask_set(
                regs.ic_intr_mask().as_ptr(),
                (Status::RX_FULL | Status::TX_ABRT).bits(),
            );
        }
        st.rdone.wait();
        st.rdone.clear();
        st.rdata.store(core::ptr::null_mut(), Ordering::Relaxed);
    }

    fn read_dma(&mut self, buf: &mut [u8]) {
        // The single borrowed channel may still be busy with a DMA write.
        if D::state().wn.load(Ordering::Acquire) == -1 {
            self.flush();
        }
        let regs = D::regs();
        if abort_latched(regs) {
            return;
        }
        let Some(ch) = self.dma.as_ref() else { return };
        let st = D::state();
        st.rn.store(-1, Ordering::Release);
        ch.check_and_clear_irq(self.dma_irq);
        ch.set_read_addr(regs.ic_data_cmd().as_ptr() as u32);
        ch.set_write_addr(buf.as_mut_ptr() as u32);
        ch.set_trans_count(buf.len() as u32);
        ch.set_config_trig(DmaConfig::new(D::rx_treq()).incr_write());
        ch.enable_irq(self.dma_irq);
        unsafe {
            write_bitmask_set(regs.ic_intr_mask().as_ptr(), Status::TX_ABRT.bits());
        }
        st.rdone.wait();
        st.rdone.clear();
    }

    /// Feeds a command stream and drains the requested bytes concurrently,
    /// returning when both sides are done.
    ///
    /// This is the safe general entry point for caller-framed transactions:
    /// the command feed continues from the interrupt handler while this
    /// thread drains the Rx FIFO, so reads larger than the FIFO cannot
    /// deadlock. Check [`I2cMaster::err`] afterwards.
    pub fn transfer(&mut self, cmds: &mut [CmdWord], rx: &mut [u8]) {
        if !cmds.is_empty() {
            self.flush();
            // The borrows of `cmds` and `rx` outlive the flush below, so the
            // engine never holds a dangling descriptor.
            unsafe { self.start_write_raw(cmds.as_mut_ptr() as *mut u8, cmds.len(), true) };
        }
        self.read_bytes(rx);
        self.flush();
    }

    /// The flags that correspond to the current master state (`RX_FULL`,
    /// `TX_EMPTY`) and the latched events. See [`Status`].
    pub fn status(&self) -> Status {
        Status::from_bits(self.i2c.ic_raw_intr_stat().read().bits() & Status::MASK)
    }

    /// Clears latched events, except `TX_ABRT` which is cleared through
    /// [`I2cMaster::err`].
    pub fn clear(&mut self, flags: Status) {
        if flags.contains(Status::ACTIVITY) {
            self.i2c.ic_clr_activity().read().clr_activity();
        }
        if flags.contains(Status::STOP_DET) {
            self.i2c.ic_clr_stop_det().read().clr_stop_det();
        }
        if flags.contains(Status::START_DET) {
            self.i2c.ic_clr_start_det().read().clr_start_det();
        }
    }

    /// Waits for any of the given state/event flags, sleeping on the
    /// peripheral interrupt if none is set yet.
    ///
    /// Shares the read-side descriptor: don't call it with a read
    /// outstanding.
    pub fn wait(&mut self, flags: Status) {
        let flags = flags.bits() & Status::MASK;
        if flags == 0 {
            return;
        }
        let regs = D::regs();
        if regs.ic_raw_intr_stat().read().bits() & flags != 0 {
            return;
        }
        let st = D::state();
        st.rn.store(-(flags as i32), Ordering::Release);
        unsafe { write_bitmask_set(regs.ic_intr_mask().as_ptr(), flags) };
        st.rdone.wait();
        st.rdone.clear();
    }

    /// Returns the latched abort, if any, wrapped in [`Error::Abort`]. With
    /// `clear` the hardware latch is also reset, which is required before
    /// any further transaction can proceed.
    ///
    /// Errors are asynchronous relative to the write call that caused them;
    /// [`I2cMaster::wait`] for `STOP_DET` first to synchronize.
    pub fn err(&mut self, clear: bool) -> Option<Error> {
        let abort = self.i2c.ic_tx_abrt_source().read().bits();
        if abort & ABRT_FLAGS != 0 {
            if clear {
                self.i2c.ic_clr_tx_abrt().read();
            }
            Some(Error::Abort(abort))
        } else {
            None
        }
    }

    /// Aborts the transfer in progress, issuing a STOP. Useful together with
    /// `wait(Status::TX_EMPTY)` to terminate a transaction whose last
    /// command could not carry the STOP flag up front.
    ///
    /// No-op when an abort is already latched.
    pub fn abort(&mut self) {
        let regs = D::regs();
        if abort_latched(regs) {
            return;
        }
        unsafe { write_bitmask_set(regs.ic_enable().as_ptr(), ENABLE_ABORT) };
        // A short grace period is usually enough for ABRT_USER_ABRT to
        // latch; the interrupt-driven wait below is the authoritative path.
        arch::delay(1_000);
        if regs.ic_tx_abrt_source().read().bits() & ABRT_FLAGS == ABRT_USER_ABRT {
            regs.ic_clr_tx_abrt().read();
            return;
        }
        let st = D::state();
        st.rn.store(-(Status::TX_ABRT.bits() as i32), Ordering::Release);
        unsafe { write_bitmask_set(regs.ic_intr_mask().as_ptr(), Status::TX_ABRT.bits()) };
        st.rdone.wait();
        st.rdone.clear();
        if regs.ic_tx_abrt_source().read().bits() & ABRT_FLAGS == ABRT_USER_ABRT {
            regs.ic_clr_tx_abrt().read();
        }
    }

    /// The peripheral's interrupt handler. Bind it to the I2C0_IRQ/I2C1_IRQ
    /// matching the driven instance.
    pub fn on_interrupt() {
        let regs = D::regs();
        let st = D::state();

        // Mask everything first and re-arm selectively on the way out. This
        // races the thread's mask set: if this clear lands between the
        // thread's publish and its mask set the ISR runs once more, finds
        // the counts it already zeroed, and does nothing.
        unsafe {
            regs.ic_intr_mask().write_with_zero(|w| w);
        }

        if regs.ic_tx_abrt_source().read().bits() & (ABRT_FLAGS & !ABRT_USER_ABRT) != 0 {
            // Both FIFOs are held flushed until TX_ABRT is cleared, so both
            // directions are dead. Data delivered so far stays valid.
            let wn = st.wn.load(Ordering::Acquire);
            let rn = st.rn.load(Ordering::Acquire);
            if wn == -1 || rn == -1 {
                let ch = st.dma_ch.load(Ordering::Relaxed);
                if ch != NO_DMA {
                    let slot = st.dma_irq.load(Ordering::Relaxed) as usize;
                    dma::raw_disable_irq(ch, slot);
                    dma::raw_abort(ch);
                }
            }
            if wn != 0 {
                st.wn.store(0, Ordering::Release);
                st.wdone.wake();
            }
            if rn != 0 {
                st.rn.store(0, Ordering::Release);
                st.rdone.wake();
            }
            return;
        }

        let mut enable: u32 = 0;

        // Read or wait part.
        let mut done = false;
        let rn = st.rn.load(Ordering::Acquire);
        if rn > 0 {
            let mut flags = (Status::RX_FULL | Status::TX_ABRT).bits();
            let avail = regs.ic_rxflr().read().rxflr().bits() as usize;
            if avail != 0 {
                let n = rn as usize;
                let mut i = st.ri.load(Ordering::Relaxed);
                let data = st.rdata.load(Ordering::Relaxed);
                let m = min(n, i + avail);
                while i < m {
                    unsafe { data.add(i).write(regs.ic_data_cmd().read().dat().bits()) };
                    i += 1;
                }
                st.ri.store(i, Ordering::Relaxed);
                let left = n - i;
                if left == 0 {
                    flags = 0;
                    done = true;
                } else if left < Self::RX_FIFO_DEPTH {
                    // Shrink the threshold to the size of the tail chunk.
                    regs.ic_rx_tl()
                        .write(|w| unsafe { w.rx_tl().bits(left as u8 - 1) });
                }
            }
            enable |= flags;
        } else if rn < -1 {
            // Pure status wait; DMA reads (-1) complete via on_dma_interrupt.
            let flags = (-rn) as u32;
            if regs.ic_raw_intr_stat().read().bits() & flags != 0 {
                done = true;
            } else {
                enable |= flags;
            }
        }
        if done {
            st.rn.store(0, Ordering::Release);
            st.rdone.wake();
        }

        // Write part. May run concurrently with a thread-mode read drain.
        let wn = st.wn.load(Ordering::Acquire);
        if wn > 0 {
            let mut flags = (Status::TX_EMPTY | Status::TX_ABRT).bits();
            let n = wn as usize;
            let mut i = st.wi.load(Ordering::Relaxed);
            let data = st.wdata.load(Ordering::Relaxed);
            if st.wcmd.load(Ordering::Relaxed) {
                let cmds = unsafe { core::slice::from_raw_parts_mut(data as *mut CmdWord, n) };
                i = push_cmds(
                    cmds,
                    i,
                    || regs.ic_status().read().tfnf().bit_is_set(),
                    |bits| regs.ic_data_cmd().write(|w| unsafe { w.bits(bits) }),
                );
            } else {
                let bytes = unsafe { core::slice::from_raw_parts(data as *const u8, n) };
                while i < n && regs.ic_status().read().tfnf().bit_is_set() {
                    regs.ic_data_cmd()
                        .write(|w| unsafe { w.bits(bytes[i] as u32) });
                    i += 1;
                }
            }
            st.wi.store(i, Ordering::Relaxed);
            if i == n {
                flags = 0;
                st.wn.store(0, Ordering::Release);
                st.wdone.wake();
            }
            enable |= flags;
        }

        // Re-arm only the unfinished directions.
        if enable != 0 {
            unsafe { write_bitmask_set(regs.ic_intr_mask().as_ptr(), enable) };
        }
    }

    /// Completion handler for the borrowed DMA channel. Bind it to the
    /// DMA_IRQ_n line the driver was constructed on; it is a no-op when the
    /// pending interrupt belongs to another channel.
    pub fn on_dma_interrupt() {
        let st = D::state();
        let ch = st.dma_ch.load(Ordering::Relaxed);
        if ch == NO_DMA {
            return;
        }
        let slot = st.dma_irq.load(Ordering::Relaxed) as usize;
        if !dma::raw_check_and_clear_irq(ch, slot) {
            return;
        }
        dma::raw_disable_irq(ch, slot);
        if st.wn.load(Ordering::Acquire) == -1 {
            st.wn.store(0, Ordering::Release);
            st.wdone.wake();
        } else if st.rn.load(Ordering::Acquire) == -1 {
            st.rn.store(0, Ordering::Release);
            st.rdone.wake();
        }
    }
}

impl<D: I2cDevice> I2cMaster<D> {
    fn read_op(&mut self, first: bool, buf: &mut [u8], stop: bool) -> Result<(), Error> {
        let total = buf.len();
        let mut offset = 0;
        while offset < total {
            let chunk = min(256, total - offset);
            let last_chunk = offset + chunk == total;
            let mut cmd = CmdWord::recv(chunk as u16);
            if offset == 0 && !first {
                cmd = cmd.with_restart();
            }
            if stop && last_chunk {
                cmd = cmd.with_stop();
            }
            let mut cmds = [cmd];
            self.transfer(&mut cmds, &mut buf[offset..offset + chunk]);
            if let Some(e) = self.err(true) {
                return Err(e);
            }
            offset += chunk;
        }
        Ok(())
    }

    fn write_op(&mut self, first: bool, bytes: &[u8], stop: bool) -> Result<(), Error> {
        let total = bytes.len();
        let mut cmds = [CmdWord::send(0); 32];
        let mut offset = 0;
        while offset < total {
            let chunk = min(cmds.len(), total - offset);
            for (cw, b) in cmds[..chunk].iter_mut().zip(&bytes[offset..offset + chunk]) {
                *cw = CmdWord::send(*b);
            }
            if offset == 0 && !first {
                cmds[0] = cmds[0].with_restart();
            }
            if stop && offset + chunk == total {
                cmds[chunk - 1] = cmds[chunk - 1].with_stop();
            }
            self.transfer(&mut cmds[..chunk], &mut []);
            if let Some(e) = self.err(true) {
                return Err(e);
            }
            offset += chunk;
        }
        Ok(())
    }
}

impl<D: I2cDevice> eh1::ErrorType for I2cMaster<D> {
    type Error = Error;
}

impl<A: ValidAddress, D: I2cDevice> eh1::I2c<A> for I2cMaster<D> {
    fn transaction(
        &mut self,
        address: A,
        operations: &mut [eh1::Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.set_addr(address)?;
        // Drop aborts latched by earlier traffic.
        let _ = self.err(true);

        let n_ops = operations.len();
        let mut first = true;
        for (oi, op) in operations.iter_mut().enumerate() {
            let last_op = oi + 1 == n_ops;
            let had_bytes = match op {
                eh1::Operation::Read(buf) => {
                    self.read_op(first, buf, last_op)?;
                    !buf.is_empty()
                }
                eh1::Operation::Write(buf) => {
                    self.write_op(first, buf, last_op)?;
                    !buf.is_empty()
                }
            };
            if had_bytes {
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scl_timing_400khz_at_125mhz() {
        let (hcnt, lcnt, spklen, sda_hold) = scl_timing(400_000, 125_000_000);
        assert_eq!(lcnt, 187);
        assert_eq!(hcnt, 126);
        assert_eq!(spklen, 11);
        assert_eq!(sda_hold, 38);
    }

    #[test]
    fn scl_timing_100khz_at_125mhz() {
        let (hcnt, lcnt, spklen, sda_hold) = scl_timing(100_000, 125_000_000);
        assert_eq!(lcnt, 750);
        assert_eq!(hcnt, 500);
        assert_eq!(spklen, 46);
        assert_eq!(sda_hold, 38);
    }
}
