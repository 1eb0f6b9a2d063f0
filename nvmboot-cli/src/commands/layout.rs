//! Layout command implementation.

use anyhow::Result;
use nvmboot::{BootConfig, TransportKind};

use crate::config::Config;

/// Transports enabled in the configuration.
fn enabled_transports(boot: &BootConfig) -> Vec<TransportKind> {
    [
        (boot.rs232.is_some(), TransportKind::Rs232),
        (boot.usb.is_some(), TransportKind::Usb),
        (boot.modbus.is_some(), TransportKind::Modbus),
        (boot.can.is_some(), TransportKind::Can),
    ]
    .into_iter()
    .filter_map(|(enabled, kind)| enabled.then_some(kind))
    .collect()
}

/// Print the sector table, checksum placement and enabled transports.
pub(crate) fn cmd_layout(config: &Config, json: bool) -> Result<()> {
    let boot = config.boot()?;
    let table = boot.flash.sector_table()?;
    let checksum = &boot.flash.checksum;
    let transports = enabled_transports(&boot);

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "write_block_size": boot.flash.write_block_size,
                "user_program_base": table.lowest_start(),
                "highest_address": table.highest_address(),
                "total_size": table.total_size(),
                "sectors": table.sectors(),
                "checksum": checksum,
                "transports": transports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Sectors:");
    for sector in table.sectors() {
        println!("  {sector}");
    }
    println!();
    println!("User program base:  {:#010x}", table.lowest_start());
    println!("Highest address:    {:#010x}", table.highest_address());
    println!("Total size:         {:#x} bytes", table.total_size());
    println!("Write block size:   {} bytes", boot.flash.write_block_size);
    println!(
        "Checksum:           {:?} {:?}-endian at +{:#x}, {} vector words",
        checksum.width, checksum.byte_order, checksum.offset, checksum.vector_words
    );
    if transports.is_empty() {
        println!("Transports:         none configured");
    } else {
        let names: Vec<String> = transports.iter().map(ToString::to_string).collect();
        println!("Transports:         {}", names.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvmboot::{CanConfig, FramingConfig, ModbusConfig};

    #[test]
    fn test_enabled_transports() {
        let boot = BootConfig::default();
        assert!(enabled_transports(&boot).is_empty());

        let boot = BootConfig::default()
            .with_modbus(ModbusConfig::default())
            .with_rs232(FramingConfig::default())
            .with_can(CanConfig::default());
        assert_eq!(
            enabled_transports(&boot),
            vec![TransportKind::Rs232, TransportKind::Modbus, TransportKind::Can]
        );
    }

    #[test]
    fn test_layout_serializes() {
        let config = Config::default();
        assert!(cmd_layout(&config, true).is_ok());
        assert!(cmd_layout(&config, false).is_ok());
    }
}
