//! Configuration file support for nvmboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (NVMBOOT_*)
//! 3. Local config file (./nvmboot.toml)
//! 4. Global config file (~/.config/nvmboot/config.toml)
//!
//! A file given with `--config` replaces both config files.

use anyhow::Context;
use directories::ProjectDirs;
use log::{debug, warn};
use nvmboot::{
    BootConfig, CanConfig, FlashConfig, FramingConfig, ModbusConfig, Parity, StopBits,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "nvmboot.toml";

/// Serial port settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Parity.
    pub parity: Option<Parity>,
    /// Stop bits.
    pub stop_bits: Option<StopBits>,
    /// Drive RTS low to enable the RS-485 transmitter.
    pub rts_active_low: Option<bool>,
}

/// Main configuration structure.
///
/// The bootloader sections replace each other as a whole when merged, the
/// port section is merged field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash layout.
    pub flash: Option<FlashConfig>,
    /// RS-232 framing.
    pub rs232: Option<FramingConfig>,
    /// USB framing.
    pub usb: Option<FramingConfig>,
    /// Modbus RTU.
    pub modbus: Option<ModbusConfig>,
    /// CAN.
    pub can: Option<CanConfig>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific file, warning on errors.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "nvmboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Port config
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }
        if other.port.parity.is_some() {
            self.port.parity = other.port.parity;
        }
        if other.port.stop_bits.is_some() {
            self.port.stop_bits = other.port.stop_bits;
        }
        if other.port.rts_active_low.is_some() {
            self.port.rts_active_low = other.port.rts_active_low;
        }

        // Bootloader sections
        if other.flash.is_some() {
            self.flash = other.flash;
        }
        if other.rs232.is_some() {
            self.rs232 = other.rs232;
        }
        if other.usb.is_some() {
            self.usb = other.usb;
        }
        if other.modbus.is_some() {
            self.modbus = other.modbus;
        }
        if other.can.is_some() {
            self.can = other.can;
        }
    }

    /// Validated bootloader configuration, with defaults for missing sections.
    pub fn boot(&self) -> nvmboot::Result<BootConfig> {
        let boot = BootConfig {
            flash: self.flash.clone().unwrap_or_default(),
            rs232: self.rs232,
            usb: self.usb,
            modbus: self.modbus,
            can: self.can,
        };
        boot.validate()?;
        Ok(boot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvmboot::{FrameChecksum, SectorDescriptor};

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.serial.is_none());
        assert!(config.port.baud.is_none());
        assert!(config.flash.is_none());
        assert!(config.modbus.is_none());
        let boot = config.boot().unwrap();
        assert_eq!(boot.flash, FlashConfig::default());
        assert!(boot.rs232.is_none());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_port_fields() {
        let mut base = Config::default();
        base.port.serial = Some("/dev/ttyUSB0".to_string());
        base.port.baud = Some(19_200);

        let mut other = Config::default();
        other.port.baud = Some(57_600);
        other.port.parity = Some(Parity::Even);

        base.merge(other);
        assert_eq!(base.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.port.baud, Some(57_600));
        assert_eq!(base.port.parity, Some(Parity::Even));
    }

    #[test]
    fn test_config_merge_replaces_sections() {
        let mut base = Config::default();
        base.modbus = Some(ModbusConfig::default().with_node_id(5));
        base.rs232 = Some(FramingConfig::default());

        let mut other = Config::default();
        other.modbus = Some(ModbusConfig::default().with_node_id(9));

        base.merge(other);
        assert_eq!(base.modbus.map(|m| m.node_id), Some(9));
        assert!(base.rs232.is_some());
    }

    // ---- TOML serialization/deserialization ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port]
serial = "/dev/ttyUSB0"
baud = 115200
parity = "even"
rts_active_low = true

[flash]
write_block_size = 1024

[[flash.sectors]]
start = 0x08004000
size = 0x4000
id = 1

[[flash.sectors]]
start = 0x08008000
size = 0x4000
id = 2

[rs232]
rx_timeout_ms = 50
checksum = "byte-sum"

[modbus]
node_id = 17

[can]
tx_msg_id = 0x18000001
rx_msg_id = 0x18000002
extended_id = true
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port.baud, Some(115_200));
        assert_eq!(config.port.parity, Some(Parity::Even));
        assert_eq!(config.port.rts_active_low, Some(true));

        let boot = config.boot().unwrap();
        assert_eq!(boot.flash.write_block_size, 1024);
        assert_eq!(
            boot.flash.sectors,
            vec![
                SectorDescriptor::new(0x0800_4000, 0x4000, 1),
                SectorDescriptor::new(0x0800_8000, 0x4000, 2),
            ]
        );
        let rs232 = boot.rs232.unwrap();
        assert_eq!(rs232.rx_timeout_ms, 50);
        assert_eq!(rs232.checksum, FrameChecksum::ByteSum);
        assert_eq!(rs232.max_rx_data, 64);
        let modbus = boot.modbus.unwrap();
        assert_eq!(modbus.node_id, 17);
        assert_eq!(modbus.function_code, 109);
        let can = boot.can.unwrap();
        assert!(can.extended_id);
        assert_eq!(can.rx_msg_id, 0x1800_0002);
        assert_eq!(can.baudrate, 500_000);
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.serial.is_none());
        assert!(config.flash.is_none());
    }

    #[test]
    fn test_invalid_section_is_reported() {
        let config: Config = toml::from_str("[modbus]\nnode_id = 0\n").unwrap();
        assert!(config.boot().is_err());

        let config: Config = toml::from_str("[flash]\nwrite_block_size = 300\n").unwrap();
        assert!(config.boot().is_err());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.port.serial = Some("COM3".to_string());
        config.flash = Some(FlashConfig::default().with_write_block_size(256));
        config.usb = Some(FramingConfig::default().with_max_data(32, 32));

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.port.serial.as_deref(), Some("COM3"));
        assert_eq!(deserialized.flash, config.flash);
        assert_eq!(deserialized.usb, config.usb);
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        fs::write(&path, "[port]\nserial = \"/dev/ttyUSB1\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.port.serial.as_deref(), Some("/dev/ttyUSB1"));
    }

    #[test]
    fn test_load_from_path_errors() {
        assert!(Config::load_from_path(Path::new("/nonexistent/path/config.toml")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[port\n").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("nvmboot"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
