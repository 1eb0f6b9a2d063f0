//! Serial port adapter for hosted targets.
//!
//! Lets the transports run on a PC serial port, e.g. an RS-485 USB adapter
//! whose RTS line switches the transceiver direction.
//!
//! ```text
//! +------------------+     +------------------+
//! |  PacketFramer    |     |   ModbusRtu      |
//! +--------+---------+     +--------+---------+
//!          |  ByteChannel           |  RtuLine
//!          v                        v
//! +--------+------------------------+---------+
//! |              PortChannel<P>               |
//! +--------------------+----------------------+
//!                      |  Port
//!                      v
//!            +---------+---------+
//!            | NativePort        |
//!            | (serialport)      |
//!            +-------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use log::{trace, warn};

use crate::error::Result;
use crate::hal::{ByteChannel, RtuLine};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 57_600,
            timeout: Duration::from_millis(10),
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the number of stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Byte-stream port with the status queries the transports need.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&self) -> Result<u32>;

    /// Number of bytes still waiting to be sent.
    fn bytes_to_write(&self) -> Result<u32>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;
}

/// Size of the receive staging buffer of a [`PortChannel`].
const RX_CHUNK: usize = 64;

/// Adapts a [`Port`] to the byte primitive of the transports.
///
/// Received bytes are fetched in chunks and handed out one at a time. I/O
/// errors cannot be reported through the byte primitive; they are logged and
/// counted.
pub struct PortChannel<P> {
    port: P,
    rx: [u8; RX_CHUNK],
    rx_pos: usize,
    rx_len: usize,
    rts_active_low: bool,
    errors: u32,
}

impl<P: Port> PortChannel<P> {
    /// Wrap `port`. RTS high enables the line driver.
    pub fn new(port: P) -> Self {
        Self {
            port,
            rx: [0u8; RX_CHUNK],
            rx_pos: 0,
            rx_len: 0,
            rts_active_low: false,
            errors: 0,
        }
    }

    /// Drive RTS low to enable the line driver.
    #[must_use]
    pub fn with_rts_active_low(mut self, active_low: bool) -> Self {
        self.rts_active_low = active_low;
        self
    }

    /// Number of I/O errors swallowed so far.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Borrow the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the adapter and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    fn refill(&mut self) {
        let available = match self.port.bytes_to_read() {
            Ok(0) => return,
            Ok(n) => (n as usize).min(RX_CHUNK),
            Err(e) => {
                self.record_error("query receive queue", &e);
                return;
            },
        };
        match self.port.read(&mut self.rx[..available]) {
            Ok(n) => {
                trace!("port rx {:02X?}", &self.rx[..n]);
                self.rx_pos = 0;
                self.rx_len = n;
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(e) => self.record_error("read", &e),
        }
    }

    fn record_error(&mut self, what: &str, error: &dyn std::fmt::Display) {
        self.errors += 1;
        warn!("{} failed to {what}: {error}", self.port.name());
    }
}

impl<P: Port> ByteChannel for PortChannel<P> {
    fn receive_byte(&mut self) -> Option<u8> {
        if self.rx_pos == self.rx_len {
            self.refill();
        }
        if self.rx_pos == self.rx_len {
            return None;
        }
        let byte = self.rx[self.rx_pos];
        self.rx_pos += 1;
        Some(byte)
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        match self.port.write_all(&[byte]) {
            Ok(()) => true,
            Err(e) => {
                self.record_error("write", &e);
                false
            },
        }
    }

    fn is_tx_complete(&mut self) -> bool {
        if let Err(e) = self.port.flush() {
            self.record_error("flush", &e);
            return false;
        }
        match self.port.bytes_to_write() {
            Ok(pending) => pending == 0,
            Err(e) => {
                self.record_error("query transmit queue", &e);
                false
            },
        }
    }

    fn discard_input(&mut self) {
        self.rx_pos = 0;
        self.rx_len = 0;
        if let Err(e) = self.port.clear_buffers() {
            self.record_error("clear buffers", &e);
        }
    }
}

impl<P: Port> RtuLine for PortChannel<P> {
    fn set_driver_output(&mut self, enable: bool) {
        let level = enable != self.rts_active_low;
        if let Err(e) = self.port.set_rts(level) {
            self.record_error("set RTS", &e);
        }
    }
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::NativePort;
