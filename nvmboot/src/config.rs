//! Bootloader configuration.
//!
//! Targets usually build a [`BootConfig`] in code; hosted ports can load it
//! from a file with the `serde` feature enabled. Everything is checked once by
//! [`BootConfig::validate`], so the runtime never sees an impossible layout.

use crate::error::{Error, Result};
use crate::nvm::{ChecksumConfig, DEFAULT_WRITE_BLOCK_SIZE, SectorDescriptor, SectorTable};

/// Write-block sizes the block manager can be instantiated with.
pub const SUPPORTED_BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Highest Modbus slave address.
pub const MODBUS_MAX_NODE_ID: u8 = 247;

/// Highest 11-bit CAN identifier.
pub const CAN_MAX_STD_ID: u32 = 0x7FF;

/// Highest 29-bit CAN identifier.
pub const CAN_MAX_EXT_ID: u32 = 0x1FFF_FFFF;

/// Bit rates a classic CAN bus can run at.
const CAN_BAUDRATES: std::ops::RangeInclusive<u32> = 10_000..=1_000_000;

/// Default flash layout: seven 8 KiB sectors above an 8 KiB bootloader.
const DEFAULT_SECTORS: [SectorDescriptor; 7] = [
    SectorDescriptor::new(0x0800_2000, 0x2000, 1),
    SectorDescriptor::new(0x0800_4000, 0x2000, 2),
    SectorDescriptor::new(0x0800_6000, 0x2000, 3),
    SectorDescriptor::new(0x0800_8000, 0x2000, 4),
    SectorDescriptor::new(0x0800_A000, 0x2000, 5),
    SectorDescriptor::new(0x0800_C000, 0x2000, 6),
    SectorDescriptor::new(0x0800_E000, 0x2000, 7),
];

/// Flash layout and checksum placement.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FlashConfig {
    /// Size of one write block in bytes.
    pub write_block_size: usize,
    /// Sectors the bootloader may program and erase.
    pub sectors: Vec<SectorDescriptor>,
    /// Signature checksum settings.
    pub checksum: ChecksumConfig,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            write_block_size: DEFAULT_WRITE_BLOCK_SIZE,
            sectors: DEFAULT_SECTORS.to_vec(),
            checksum: ChecksumConfig::default(),
        }
    }
}

impl FlashConfig {
    /// Replace the sector list.
    #[must_use]
    pub fn with_sectors(mut self, sectors: Vec<SectorDescriptor>) -> Self {
        self.sectors = sectors;
        self
    }

    /// Set the write-block size.
    #[must_use]
    pub fn with_write_block_size(mut self, size: usize) -> Self {
        self.write_block_size = size;
        self
    }

    /// Set the checksum placement.
    #[must_use]
    pub fn with_checksum(mut self, checksum: ChecksumConfig) -> Self {
        self.checksum = checksum;
        self
    }

    /// Build the validated sector table.
    pub fn sector_table(&self) -> Result<SectorTable> {
        SectorTable::new(self.sectors.clone())
    }

    /// Check block size, sector table and checksum placement.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BLOCK_SIZES.contains(&self.write_block_size) {
            return Err(Error::Config(format!(
                "write block size {} not supported, use one of {SUPPORTED_BLOCK_SIZES:?}",
                self.write_block_size
            )));
        }
        let table = self.sector_table()?;
        #[allow(clippy::cast_possible_truncation)] // at most 2048
        let block = self.write_block_size as u32;
        if table.lowest_start() % block != 0 {
            return Err(Error::Config(format!(
                "user program base {:#010x} is not aligned to the {block}-byte write block",
                table.lowest_start()
            )));
        }
        self.checksum.validate(self.write_block_size)
    }
}

/// Trailing checksum of a length-prefixed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum FrameChecksum {
    /// No checksum byte.
    #[default]
    None,
    /// Wrapping sum of the length byte and all payload bytes.
    ByteSum,
}

impl FrameChecksum {
    /// Number of checksum bytes on the wire.
    pub const fn len(self) -> usize {
        match self {
            Self::None => 0,
            Self::ByteSum => 1,
        }
    }
}

/// Settings of a length-prefixed packet transport (RS-232, USB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FramingConfig {
    /// Largest payload accepted from the host.
    pub max_rx_data: u8,
    /// Largest payload sent to the host.
    pub max_tx_data: u8,
    /// Silence after which a partial packet is dropped.
    pub rx_timeout_ms: u32,
    /// How long one byte may wait for the transmitter.
    pub byte_tx_timeout_ms: u32,
    /// Optional trailing checksum byte.
    pub checksum: FrameChecksum,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_rx_data: 64,
            max_tx_data: 64,
            rx_timeout_ms: 100,
            byte_tx_timeout_ms: 10,
            checksum: FrameChecksum::None,
        }
    }
}

impl FramingConfig {
    /// Set both maximum payload sizes.
    #[must_use]
    pub fn with_max_data(mut self, rx: u8, tx: u8) -> Self {
        self.max_rx_data = rx;
        self.max_tx_data = tx;
        self
    }

    /// Set the packet reception timeout.
    #[must_use]
    pub fn with_rx_timeout_ms(mut self, ms: u32) -> Self {
        self.rx_timeout_ms = ms;
        self
    }

    /// Set the trailing checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: FrameChecksum) -> Self {
        self.checksum = checksum;
        self
    }

    /// Check that payload limits and timeouts are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_rx_data == 0 || self.max_tx_data == 0 {
            return Err(Error::Config("maximum packet data must be at least 1".into()));
        }
        if self.rx_timeout_ms == 0 {
            return Err(Error::Config("packet reception timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Settings of the Modbus RTU transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ModbusConfig {
    /// Line speed, used for the T3.5 idle time.
    pub baudrate: u32,
    /// Slave address of this node.
    pub node_id: u8,
    /// Function code that carries update-protocol packets.
    pub function_code: u8,
    /// Largest embedded payload accepted.
    pub max_rx_data: u8,
    /// Largest embedded payload sent.
    pub max_tx_data: u8,
    /// Settling time around switching the line driver on.
    pub driver_enable_delay_us: u32,
    /// Settling time around switching the line driver off.
    pub driver_disable_delay_us: u32,
    /// How long one byte may wait for the transmitter.
    pub byte_tx_timeout_ms: u32,
    /// Upper bound of the idle-line wait in `init`.
    pub idle_wait_timeout_ms: u32,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            baudrate: 57_600,
            node_id: 1,
            function_code: 109,
            max_rx_data: 64,
            max_tx_data: 64,
            driver_enable_delay_us: 10,
            driver_disable_delay_us: 10,
            byte_tx_timeout_ms: 10,
            idle_wait_timeout_ms: 1000,
        }
    }
}

impl ModbusConfig {
    /// Set the baud rate.
    #[must_use]
    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    /// Set the node id.
    #[must_use]
    pub fn with_node_id(mut self, node_id: u8) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the function code.
    #[must_use]
    pub fn with_function_code(mut self, function_code: u8) -> Self {
        self.function_code = function_code;
        self
    }

    /// Check node id, baud rate and payload limits.
    pub fn validate(&self) -> Result<()> {
        if self.baudrate == 0 {
            return Err(Error::Config("modbus baudrate must be non-zero".into()));
        }
        if self.node_id == 0 || self.node_id > MODBUS_MAX_NODE_ID {
            return Err(Error::Config(format!(
                "modbus node id {} outside 1..={MODBUS_MAX_NODE_ID}",
                self.node_id
            )));
        }
        if self.max_rx_data == 0 || self.max_tx_data == 0 {
            return Err(Error::Config("maximum packet data must be at least 1".into()));
        }
        Ok(())
    }
}

/// Settings of the CAN transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CanConfig {
    /// Bus bit rate.
    pub baudrate: u32,
    /// Identifier of the messages this node sends.
    pub tx_msg_id: u32,
    /// Identifier of the messages addressed to this node.
    pub rx_msg_id: u32,
    /// Use 29-bit identifiers for both directions.
    pub extended_id: bool,
    /// How long a message may wait for a mailbox and for its acknowledge.
    pub tx_timeout_ms: u32,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            baudrate: 500_000,
            tx_msg_id: 0x7E1,
            rx_msg_id: 0x667,
            extended_id: false,
            tx_timeout_ms: 50,
        }
    }
}

impl CanConfig {
    /// Set both message identifiers.
    #[must_use]
    pub fn with_ids(mut self, tx_msg_id: u32, rx_msg_id: u32) -> Self {
        self.tx_msg_id = tx_msg_id;
        self.rx_msg_id = rx_msg_id;
        self
    }

    /// Switch to 29-bit identifiers.
    #[must_use]
    pub fn with_extended_id(mut self, extended: bool) -> Self {
        self.extended_id = extended;
        self
    }

    /// Set the bus bit rate.
    #[must_use]
    pub fn with_baudrate(mut self, baudrate: u32) -> Self {
        self.baudrate = baudrate;
        self
    }

    /// Check bit rate and identifiers.
    pub fn validate(&self) -> Result<()> {
        if !CAN_BAUDRATES.contains(&self.baudrate) {
            return Err(Error::Config(format!(
                "CAN baudrate {} outside {}..={}",
                self.baudrate,
                CAN_BAUDRATES.start(),
                CAN_BAUDRATES.end()
            )));
        }
        let max = if self.extended_id {
            CAN_MAX_EXT_ID
        } else {
            CAN_MAX_STD_ID
        };
        for (name, id) in [("tx", self.tx_msg_id), ("rx", self.rx_msg_id)] {
            if id > max {
                return Err(Error::Config(format!(
                    "CAN {name} message id {id:#x} exceeds {max:#x}"
                )));
            }
        }
        if self.tx_msg_id == self.rx_msg_id {
            return Err(Error::Config(format!(
                "CAN tx and rx message ids are both {:#x}",
                self.tx_msg_id
            )));
        }
        if self.tx_timeout_ms == 0 {
            return Err(Error::Config("CAN transmit timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Complete bootloader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BootConfig {
    /// Flash layout.
    pub flash: FlashConfig,
    /// RS-232 transport, if enabled.
    pub rs232: Option<FramingConfig>,
    /// USB bulk transport, if enabled.
    pub usb: Option<FramingConfig>,
    /// Modbus RTU transport, if enabled.
    pub modbus: Option<ModbusConfig>,
    /// CAN transport, if enabled.
    pub can: Option<CanConfig>,
}

impl BootConfig {
    /// Replace the flash settings.
    #[must_use]
    pub fn with_flash(mut self, flash: FlashConfig) -> Self {
        self.flash = flash;
        self
    }

    /// Enable the RS-232 transport.
    #[must_use]
    pub fn with_rs232(mut self, config: FramingConfig) -> Self {
        self.rs232 = Some(config);
        self
    }

    /// Enable the USB transport.
    #[must_use]
    pub fn with_usb(mut self, config: FramingConfig) -> Self {
        self.usb = Some(config);
        self
    }

    /// Enable the Modbus RTU transport.
    #[must_use]
    pub fn with_modbus(mut self, config: ModbusConfig) -> Self {
        self.modbus = Some(config);
        self
    }

    /// Enable the CAN transport.
    #[must_use]
    pub fn with_can(mut self, config: CanConfig) -> Self {
        self.can = Some(config);
        self
    }

    /// Validate every enabled section.
    pub fn validate(&self) -> Result<()> {
        self.flash.validate()?;
        if let Some(rs232) = &self.rs232 {
            rs232.validate()?;
        }
        if let Some(usb) = &self.usb {
            usb.validate()?;
        }
        if let Some(modbus) = &self.modbus {
            modbus.validate()?;
        }
        if let Some(can) = &self.can {
            can.validate()?;
        }
        Ok(())
    }
}
