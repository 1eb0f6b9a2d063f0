//! Packet transports.
//!
//! Every transport turns an unreliable byte stream into discrete, validated
//! [`Packet`]s for the update protocol:
//!
//! - [`framing`]: length-prefixed packets (RS-232, buffered USB bulk)
//! - [`modbus`]: Modbus RTU with node addressing, CRC-16 and T3.5 timing
//! - [`can`]: one CAN message per packet, filtered on a receive identifier
//! - [`fifo`] / [`usb`]: circular queues between USB endpoints and framing

pub mod can;
pub mod crc;
pub mod fifo;
pub mod framing;
pub mod modbus;
pub mod packet;
pub mod usb;

use std::fmt;

use crate::error::Result;

// Re-export common types
pub use can::{BitTiming, CAN_MAX_DLC, CanFrame, CanPeripheral, CanTransport};
pub use crc::crc16_modbus;
pub use fifo::{FifoHandle, FifoManager};
pub use framing::PacketFramer;
pub use modbus::{ModbusRtu, t35_ticks};
pub use packet::{MAX_PACKET_LEN, Packet};
pub use usb::UsbBulkChannel;

/// Physical channel a transport runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportKind {
    /// Point-to-point UART.
    Rs232,
    /// USB bulk endpoints.
    Usb,
    /// Modbus RTU over RS-485.
    Modbus,
    /// Classic CAN.
    Can,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rs232 => write!(f, "RS-232"),
            Self::Usb => write!(f, "USB"),
            Self::Modbus => write!(f, "Modbus RTU"),
            Self::Can => write!(f, "CAN"),
        }
    }
}

/// A packet transport as seen by the update protocol.
pub trait PacketTransport {
    /// Channel this transport runs on.
    fn kind(&self) -> TransportKind;

    /// Send one packet.
    fn transmit_packet(&mut self, data: &[u8]) -> Result<()>;

    /// Poll for a complete packet. Never blocks.
    fn receive_packet(&mut self) -> Option<Packet>;
}

impl<T: PacketTransport + ?Sized> PacketTransport for Box<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn transmit_packet(&mut self, data: &[u8]) -> Result<()> {
        (**self).transmit_packet(data)
    }

    fn receive_packet(&mut self) -> Option<Packet> {
        (**self).receive_packet()
    }
}
