//! Buffered USB bulk channel.
//!
//! The USB stack delivers bulk-OUT data in endpoint-sized chunks and collects
//! bulk-IN data whenever the host polls. Two FIFOs decouple those chunk sizes
//! from the byte-at-a-time [`ByteChannel`] the packet framer works on:
//!
//! ```text
//!  host --bulk OUT--> accept_bulk_out --> [OUT fifo] --> receive_byte
//!  host <--bulk IN--- fill_bulk_in    <-- [IN fifo]  <-- write_byte
//! ```

use log::warn;

use crate::error::{Error, Result};
use crate::hal::ByteChannel;
use crate::protocol::fifo::{FifoHandle, FifoManager};

/// Default FIFO capacity, one full-speed bulk packet.
pub const DEFAULT_USB_FIFO_SIZE: usize = 64;

/// Byte channel backed by a bulk-OUT and a bulk-IN FIFO.
#[derive(Debug, Clone)]
pub struct UsbBulkChannel<const CAP: usize = DEFAULT_USB_FIFO_SIZE> {
    fifos: FifoManager<2, CAP>,
    bulk_out: FifoHandle,
    bulk_in: FifoHandle,
    overruns: u32,
}

impl<const CAP: usize> UsbBulkChannel<CAP> {
    /// Create the channel with both FIFOs empty.
    pub fn new() -> Result<Self> {
        let mut fifos = FifoManager::new();
        let (Some(bulk_out), Some(bulk_in)) = (fifos.create(), fifos.create()) else {
            return Err(Error::Config("no free FIFO for the USB pipes".into()));
        };
        if CAP == 0 {
            return Err(Error::Config("USB FIFO capacity must be non-zero".into()));
        }
        Ok(Self {
            fifos,
            bulk_out,
            bulk_in,
            overruns: 0,
        })
    }

    /// Store data received on the bulk-OUT endpoint.
    ///
    /// Returns the number of bytes stored. Bytes that do not fit are dropped
    /// and counted as an overrun.
    pub fn accept_bulk_out(&mut self, chunk: &[u8]) -> usize {
        let stored = chunk
            .iter()
            .take_while(|&&byte| self.fifos.write(self.bulk_out, byte))
            .count();
        if stored < chunk.len() {
            self.overruns += 1;
            warn!(
                "USB OUT fifo overrun, dropped {} of {} bytes",
                chunk.len() - stored,
                chunk.len()
            );
        }
        stored
    }

    /// Move pending bulk-IN data into `buf`, returning how many bytes were
    /// copied.
    pub fn fill_bulk_in(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        for slot in buf.iter_mut() {
            let Some(byte) = self.fifos.read(self.bulk_in) else {
                break;
            };
            *slot = byte;
            n += 1;
        }
        n
    }

    /// Bytes waiting to be sent to the host.
    pub fn pending_in(&self) -> usize {
        self.fifos.scan(self.bulk_in)
    }

    /// Bytes received but not yet consumed.
    pub fn pending_out(&self) -> usize {
        self.fifos.scan(self.bulk_out)
    }

    /// Number of OUT chunks that did not fit completely.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Drop everything queued in both directions.
    pub fn reset(&mut self) {
        self.fifos.clear(self.bulk_out);
        self.fifos.clear(self.bulk_in);
    }
}

impl<const CAP: usize> ByteChannel for UsbBulkChannel<CAP> {
    fn receive_byte(&mut self) -> Option<u8> {
        self.fifos.read(self.bulk_out)
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        self.fifos.write(self.bulk_in, byte)
    }

    fn is_tx_ready(&mut self) -> bool {
        self.fifos.room(self.bulk_in) > 0
    }

    fn is_tx_complete(&mut self) -> bool {
        self.pending_in() == 0
    }
}
