use core::cmp::min;

use super::{CmdWord, Error, I2cDevice, I2cMaster, Status, ValidAddress};

/// A connection to one target device on the bus, created by
/// [`I2cMaster::conn`].
///
/// The connection is a byte stream: writes are plain Send commands, reads
/// issue the matching Recv command themselves, and [`I2cConn::close`] drives
/// the bus to a clean STOP and surfaces any error latched along the way. The
/// target address is programmed lazily on first use, and skipped entirely
/// when the hardware still holds it from the previous connection.
///
/// The exclusive borrow of the master is what serializes connections: as
/// long as an `I2cConn` is alive nothing else can touch the bus. To share a
/// master between threads, wrap it in a mutex and open connections inside
/// the critical section.
pub struct I2cConn<'a, D: I2cDevice, A: ValidAddress> {
    master: &'a mut I2cMaster<D>,
    addr: A,
    open: bool,
}

impl<D: I2cDevice> I2cMaster<D> {
    /// Opens a connection-oriented view of the bus for one target address.
    pub fn conn<A: ValidAddress>(&mut self, addr: A) -> I2cConn<'_, D, A> {
        I2cConn {
            master: self,
            addr,
            open: false,
        }
    }
}

impl<D: I2cDevice, A: ValidAddress> I2cConn<'_, D, A> {
    /// The target address this connection talks to.
    pub fn addr(&self) -> A {
        self.addr
    }

    fn open(&mut self) -> Result<(), Error> {
        if self.open {
            return Ok(());
        }
        let d = &mut *self.master;
        let want: u16 = self.addr.into();
        let current = d.i2c.ic_tar().read().ic_tar().bits();
        let enabled = d.i2c.ic_enable().read().enable().bit_is_set();
        if !enabled || current != want & 0x3ff {
            d.set_addr(self.addr)?;
        }
        self.open = true;
        Ok(())
    }

    /// Transmits a single byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.open()?;
        self.master.write_cmd(CmdWord::send(byte));
        match self.master.err(false) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Receives a single byte.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        self.open()?;
        self.master.write_cmd(CmdWord::recv(1));
        let b = self.master.read_byte();
        match self.master.err(false) {
            Some(e) => Err(e),
            None => Ok(b),
        }
    }

    /// Waits for the Tx FIFO to drain, drives the bus to a STOP and returns
    /// the error latched during the conversation, if any.
    ///
    /// A closed connection is a no-op, so dropping after `close` is fine.
    pub fn close(mut self) -> Result<(), Error> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), Error> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let d = &mut *self.master;
        d.wait(Status::TX_EMPTY);
        d.abort(); // the STOP condition
        match d.err(true) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<D: I2cDevice, A: ValidAddress> Drop for I2cConn<'_, D, A> {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl<D: I2cDevice, A: ValidAddress> embedded_io::ErrorType for I2cConn<'_, D, A> {
    type Error = Error;
}

impl<D: I2cDevice, A: ValidAddress> embedded_io::Write for I2cConn<'_, D, A> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.open()?;
        let d = &mut *self.master;
        // Safety: flushed before returning, so the engine never references
        // `buf` after this call.
        unsafe { d.write_bytes(buf) };
        d.flush();
        match d.err(false) {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.master.flush();
        Ok(())
    }
}

impl<D: I2cDevice, A: ValidAddress> embedded_io::Read for I2cConn<'_, D, A> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        // One Recv command addresses at most 256 bytes; short reads are
        // allowed, so larger buffers are filled over multiple calls.
        let n = min(buf.len(), 256);
        self.open()?;
        let d = &mut *self.master;
        d.write_cmd(CmdWord::recv(n as u16));
        d.read_bytes(&mut buf[..n]);
        match d.err(false) {
            Some(e) => Err(e),
            None => Ok(n),
        }
    }
}
