//! Hardware capability traits consumed by the core.
//!
//! Each target port provides a small set of primitives and the generic core
//! is written once against them:
//!
//! ```text
//! +-------------------+   +-------------------+   +-------------------+
//! |  BlockManager     |   |  PacketFramer     |   |  ModbusRtu        |
//! +---------+---------+   +---------+---------+   +---------+---------+
//!           |                       |                       |
//!           v                       v                       v
//! +---------+---------+   +---------+---------+   +---------+---------+
//! | NvmDriver         |   | ByteChannel       |   | RtuLine           |
//! | CryptoHook        |   | Clock, Watchdog   |   | FineCounter       |
//! +-------------------+   +-------------------+   +-------------------+
//! ```
//!
//! [`CanTransport`](crate::protocol::CanTransport) sits on a [`CanChannel`]
//! instead of a byte channel, one message per packet.
//!
//! Time sources and the watchdog are taken by shared reference so one
//! instance can serve every transport; blanket impls for `&T` make that
//! work without extra wrappers.

use std::time::Instant;

use crate::error::Result;
use crate::nvm::SectorDescriptor;
use crate::protocol::can::CanFrame;

/// Raw NVM programmer for one target.
pub trait NvmDriver {
    /// Read `buf.len()` bytes of current flash contents starting at `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()>;

    /// Program one write block at `address`.
    ///
    /// Implementations busy-wait for completion and verify the programmed
    /// data themselves before returning.
    fn program_block(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Erase one hardware sector.
    fn erase_sector(&mut self, sector: &SectorDescriptor) -> Result<()>;
}

impl<T: NvmDriver + ?Sized> NvmDriver for &mut T {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(address, buf)
    }

    fn program_block(&mut self, address: u32, data: &[u8]) -> Result<()> {
        (**self).program_block(address, data)
    }

    fn erase_sector(&mut self, sector: &SectorDescriptor) -> Result<()> {
        (**self).erase_sector(sector)
    }
}

/// In-place transform applied to every block image before it is committed.
pub trait CryptoHook {
    /// Decrypt `data`, the image of the block starting at `address`.
    ///
    /// Returns `false` when the data cannot be decrypted.
    fn decrypt_in_place(&mut self, address: u32, data: &mut [u8]) -> bool;

    /// Whether this hook transforms data at all.
    fn is_active(&self) -> bool {
        true
    }
}

/// Crypto hook that leaves images untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCrypto;

impl CryptoHook for NoCrypto {
    fn decrypt_in_place(&mut self, _address: u32, _data: &mut [u8]) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Single-byte primitive of one physical transport.
pub trait ByteChannel {
    /// Return a newly received byte, if any. Never blocks.
    fn receive_byte(&mut self) -> Option<u8>;

    /// Submit a byte for transmission.
    ///
    /// Returns `false` when the transmitter cannot take the byte right now.
    fn write_byte(&mut self, byte: u8) -> bool;

    /// The transmit holding register (or FIFO) can take another byte.
    fn is_tx_ready(&mut self) -> bool {
        true
    }

    /// The last submitted bit has physically left the wire.
    fn is_tx_complete(&mut self) -> bool {
        self.is_tx_ready()
    }

    /// Drop whatever the channel buffered below the byte primitive.
    fn discard_input(&mut self) {}
}

/// Half-duplex line used by Modbus RTU.
pub trait RtuLine: ByteChannel {
    /// Enable or disable the line driver (RS-485 transceiver direction).
    fn set_driver_output(&mut self, enable: bool);
}

/// Message primitive of a CAN controller.
pub trait CanChannel {
    /// Pop the next received message, whatever its identifier. Never blocks.
    fn receive_message(&mut self) -> Option<CanFrame>;

    /// Place `frame` in a transmit mailbox.
    ///
    /// Returns `false` when no mailbox is free right now.
    fn transmit_message(&mut self, frame: &CanFrame) -> bool;

    /// The last submitted message was acknowledged on the bus.
    fn is_tx_complete(&mut self) -> bool {
        true
    }
}

/// Coarse millisecond time source.
pub trait Clock {
    /// Free-running millisecond counter. Wraps around.
    fn millis(&self) -> u32;
}

/// Fine free-running counter with a resolution of [`FINE_TICK_US`].
pub trait FineCounter {
    /// Current counter value. Wraps around at 16 bits.
    fn ticks(&self) -> u16;
}

/// Watchdog that must be serviced on every iteration of a polling loop.
pub trait Watchdog {
    /// Service the watchdog.
    fn service(&self);
}

/// Resolution of [`FineCounter`] ticks in microseconds.
pub const FINE_TICK_US: u32 = 10;

impl<T: Clock + ?Sized> Clock for &T {
    fn millis(&self) -> u32 {
        (**self).millis()
    }
}

impl<T: FineCounter + ?Sized> FineCounter for &T {
    fn ticks(&self) -> u16 {
        (**self).ticks()
    }
}

impl<T: Watchdog + ?Sized> Watchdog for &T {
    fn service(&self) {
        (**self).service();
    }
}

/// Watchdog for targets that run without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn service(&self) {}
}

/// Both time sources backed by [`Instant`], for hosted targets.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Start a clock at zero.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // wrapping counter
    fn millis(&self) -> u32 {
        self.origin.elapsed().as_millis() as u32
    }
}

impl FineCounter for SystemClock {
    #[allow(clippy::cast_possible_truncation)] // wrapping counter
    fn ticks(&self) -> u16 {
        (self.origin.elapsed().as_micros() / u128::from(FINE_TICK_US)) as u16
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Deterministic test doubles for the capability traits.

    use super::{ByteChannel, CanChannel, Clock, FineCounter, RtuLine, Watchdog};
    use crate::protocol::can::CanFrame;
    use std::cell::Cell;
    use std::collections::VecDeque;

    /// Manually advanced clock covering both time sources.
    ///
    /// `step_ticks` is added on every `ticks()` read so busy-wait loops make
    /// progress without a real timer.
    #[derive(Debug, Default)]
    pub struct MockClock {
        pub ms: Cell<u32>,
        pub ticks: Cell<u16>,
        pub step_ms: Cell<u32>,
        pub step_ticks: Cell<u16>,
    }

    impl MockClock {
        pub fn stepping(step_ms: u32, step_ticks: u16) -> Self {
            let clock = Self::default();
            clock.step_ms.set(step_ms);
            clock.step_ticks.set(step_ticks);
            clock
        }

        pub fn advance_ms(&self, ms: u32) {
            self.ms.set(self.ms.get().wrapping_add(ms));
        }

        pub fn advance_ticks(&self, ticks: u16) {
            self.ticks.set(self.ticks.get().wrapping_add(ticks));
        }
    }

    impl Clock for MockClock {
        fn millis(&self) -> u32 {
            let now = self.ms.get();
            self.ms.set(now.wrapping_add(self.step_ms.get()));
            now
        }
    }

    impl FineCounter for MockClock {
        fn ticks(&self) -> u16 {
            let now = self.ticks.get();
            self.ticks.set(now.wrapping_add(self.step_ticks.get()));
            now
        }
    }

    /// Watchdog that counts how often it was serviced.
    #[derive(Debug, Default)]
    pub struct CountingWatchdog {
        pub count: Cell<u32>,
    }

    impl Watchdog for CountingWatchdog {
        fn service(&self) {
            self.count.set(self.count.get() + 1);
        }
    }

    /// Loopback-free byte channel with scripted input.
    #[derive(Debug, Default)]
    pub struct MockChannel {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
        pub tx_stuck: bool,
        pub driver_log: Vec<bool>,
        pub complete_checks: u32,
        pub discards: u32,
    }

    impl MockChannel {
        pub fn with_input(bytes: &[u8]) -> Self {
            Self {
                rx: bytes.iter().copied().collect(),
                ..Self::default()
            }
        }

        pub fn feed(&mut self, bytes: &[u8]) {
            self.rx.extend(bytes.iter().copied());
        }
    }

    impl ByteChannel for MockChannel {
        fn receive_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn write_byte(&mut self, byte: u8) -> bool {
            if self.tx_stuck {
                return false;
            }
            self.tx.push(byte);
            true
        }

        fn is_tx_ready(&mut self) -> bool {
            !self.tx_stuck
        }

        fn is_tx_complete(&mut self) -> bool {
            self.complete_checks += 1;
            !self.tx_stuck
        }

        fn discard_input(&mut self) {
            self.discards += 1;
        }
    }

    impl RtuLine for MockChannel {
        fn set_driver_output(&mut self, enable: bool) {
            self.driver_log.push(enable);
        }
    }

    /// CAN controller with scripted reception and a transmit log.
    #[derive(Debug, Default)]
    pub struct MockCan {
        pub rx: VecDeque<CanFrame>,
        pub tx: Vec<CanFrame>,
        pub mailbox_busy: bool,
        pub no_ack: bool,
    }

    impl CanChannel for MockCan {
        fn receive_message(&mut self) -> Option<CanFrame> {
            self.rx.pop_front()
        }

        fn transmit_message(&mut self, frame: &CanFrame) -> bool {
            if self.mailbox_busy {
                return false;
            }
            self.tx.push(*frame);
            true
        }

        fn is_tx_complete(&mut self) -> bool {
            !self.no_ack
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_crypto_is_passthrough() {
        let mut data = [1u8, 2, 3];
        let mut hook = NoCrypto;
        assert!(hook.decrypt_in_place(0, &mut data));
        assert_eq!(data, [1, 2, 3]);
        assert!(!hook.is_active());
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.millis();
        let b = clock.millis();
        assert!(b >= a);
    }
}
