//! # nvmboot
//!
//! Bootloader core: verified flash block management and the packet
//! transports that carry a firmware update.
//!
//! - Block-buffered flash programming with read-back verification and a
//!   vector-table signature written last, so an interrupted update never
//!   looks valid at startup
//! - Length-prefixed packet framing for RS-232 and buffered USB bulk
//! - Modbus RTU with CRC-16, node addressing and T3.5 frame timing
//! - CAN, one message per packet
//! - A multiplexer that answers on whichever transport spoke last
//!
//! Hardware is reached only through the traits in [`hal`], so the same code
//! runs on a target or, with the `native` feature, on a PC serial port.
//!
//! ## Features
//!
//! - `native` (default): serial port adapter via the `serialport` crate
//! - `serde`: serialization support for configuration types
//!
//! ## Example
//!
//! ```rust
//! use nvmboot::{BlockManager, FlashConfig, SimFlash};
//!
//! fn main() -> nvmboot::Result<()> {
//!     let config = FlashConfig::default();
//!     let table = config.sector_table()?;
//!     let flash = SimFlash::new(table.lowest_start(), table.total_size() as usize);
//!     let mut nvm: BlockManager<_> = BlockManager::new(flash, table, config.checksum)?;
//!
//!     let base = nvm.user_program_base();
//!     nvm.erase(base, 0x400)?;
//!     nvm.write(base, &[0x00, 0x20, 0x00, 0x20])?;
//!     nvm.write_checksum()?;
//!     nvm.done()?;
//!     assert!(nvm.verify_checksum());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod com;
pub mod config;
pub mod error;
pub mod hal;
pub mod nvm;
pub mod poll;
pub mod port;
pub mod protocol;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    com::Com,
    config::{BootConfig, CanConfig, FlashConfig, FrameChecksum, FramingConfig, ModbusConfig},
    error::{Error, Result},
    hal::{
        ByteChannel, CanChannel, Clock, CryptoHook, FineCounter, NoCrypto, NoWatchdog, NvmDriver, RtuLine,
        SystemClock, Watchdog,
    },
    nvm::{
        BlockManager, ChecksumConfig, ChecksumWidth, SectorDescriptor, SectorTable, SimFlash,
        WordOrder,
    },
    port::{Parity, Port, PortChannel, SerialConfig, StopBits},
    protocol::{
        BitTiming, CanFrame, CanPeripheral, CanTransport, ModbusRtu, Packet, PacketFramer,
        PacketTransport, TransportKind, UsbBulkChannel, crc16_modbus,
    },
};
