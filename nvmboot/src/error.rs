//! Error types for nvmboot.

use std::io;
use thiserror::Error;

/// Result type for nvmboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for nvmboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Address range not covered by the sector table.
    ///
    /// Rejected before any hardware access.
    #[error("Address range {address:#010x}+{len:#x} is outside the sector table")]
    Range {
        /// First address of the rejected range.
        address: u32,
        /// Length of the rejected range in bytes.
        len: u32,
    },

    /// Programming a write block failed.
    #[error("Programming failed at {address:#010x}")]
    Program {
        /// Base address of the block being programmed.
        address: u32,
    },

    /// Erasing a sector failed.
    #[error("Erasing sector {sector} failed")]
    Erase {
        /// Hardware sector identifier.
        sector: u32,
    },

    /// Read-back after programming did not match the RAM image.
    #[error("Verification mismatch at {address:#010x}")]
    VerifyMismatch {
        /// First mismatching address.
        address: u32,
    },

    /// The crypto hook refused to decrypt a block image.
    #[error("Decryption failed for block at {address:#010x}")]
    Decrypt {
        /// Base address of the block image.
        address: u32,
    },

    /// Packet length outside `1..=max`.
    #[error("Invalid packet length {len} (allowed 1..={max})")]
    PacketLength {
        /// Requested length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A bounded wait expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration invariant violated.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error (serial port, image files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl Error {
    /// Whether this error comes from a failed program, erase, read-back or
    /// decrypt step on the flash hardware.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            Self::Program { .. }
                | Self::Erase { .. }
                | Self::VerifyMismatch { .. }
                | Self::Decrypt { .. }
        )
    }
}
