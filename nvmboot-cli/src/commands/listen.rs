//! Listen command implementation.
//!
//! Runs one transport on a serial port through the com multiplexer and
//! prints every packet it delivers, optionally echoing it back.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nvmboot::{
    Com, ModbusRtu, NativePort, NoWatchdog, Packet, PacketFramer, PortChannel, SerialConfig,
    SystemClock, TransportKind,
};
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, ListenTransport, was_interrupted};

/// Pause between polls that delivered nothing.
const IDLE_POLL: Duration = Duration::from_micros(100);

/// Default line speed for RS-232 framing.
const DEFAULT_RS232_BAUD: u32 = 57_600;

/// Options of the listen command.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListenOptions {
    pub(crate) transport: ListenTransport,
    pub(crate) echo: bool,
    pub(crate) rts_active_low: bool,
    pub(crate) count: Option<usize>,
    pub(crate) json: bool,
}

/// Hex dump of a packet payload.
fn hex(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 3), |mut out, byte| {
        if !out.is_empty() {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02X}");
        out
    })
}

fn format_packet(kind: TransportKind, packet: &Packet, json: bool) -> Result<String> {
    if json {
        let line = serde_json::json!({
            "transport": kind,
            "len": packet.len(),
            "data": hex(packet.payload()),
        });
        return Ok(serde_json::to_string(&line)?);
    }
    Ok(format!("{kind} [{}] {}", packet.len(), hex(packet.payload())))
}

/// Listen command implementation.
pub(crate) fn cmd_listen(cli: &Cli, config: &Config, options: &ListenOptions) -> Result<()> {
    let boot = config.boot()?;
    let port_name = cli
        .port
        .clone()
        .or_else(|| config.port.serial.clone())
        .ok_or_else(|| {
            CliError::Usage("no serial port given, use --port or NVMBOOT_PORT".to_string())
        })?;

    let modbus = boot.modbus.unwrap_or_default();
    let baud = cli.baud.or(config.port.baud).unwrap_or(match options.transport {
        ListenTransport::Rs232 => DEFAULT_RS232_BAUD,
        ListenTransport::Modbus => modbus.baudrate,
    });

    let serial = SerialConfig::new(&port_name, baud)
        .with_parity(config.port.parity.unwrap_or_default())
        .with_stop_bits(config.port.stop_bits.unwrap_or_default());
    let port = NativePort::open(&serial).with_context(|| format!("Failed to open {port_name}"))?;
    let channel = PortChannel::new(port)
        .with_rts_active_low(options.rts_active_low || config.port.rts_active_low == Some(true));

    let mut com = Com::new();
    match options.transport {
        ListenTransport::Rs232 => {
            let framing = boot.rs232.unwrap_or_default();
            com.add(Box::new(PacketFramer::new(
                channel,
                SystemClock::new(),
                NoWatchdog,
                framing,
            )?));
        },
        ListenTransport::Modbus => {
            let mut rtu = ModbusRtu::new(
                channel,
                SystemClock::new(),
                NoWatchdog,
                modbus.with_baudrate(baud),
            )?;
            rtu.init();
            com.add(Box::new(rtu));
        },
    }

    info!("Listening on {port_name} at {baud} bps, Ctrl-C to stop");

    let mut received = 0usize;
    while !was_interrupted() {
        let Some((kind, packet)) = com.poll() else {
            std::thread::sleep(IDLE_POLL);
            continue;
        };

        println!("{}", format_packet(kind, &packet, options.json)?);
        received += 1;

        if options.echo {
            if let Err(e) = com.transmit_packet(packet.payload()) {
                warn!("Echo failed: {e}");
            }
        }
        if options.count.is_some_and(|limit| received >= limit) {
            break;
        }
    }

    debug!("Received {received} packet(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[]), "");
        assert_eq!(hex(&[0x01, 0xAB, 0xFF]), "01 AB FF");
    }

    #[test]
    fn test_format_packet() {
        let packet = Packet::new(&[0x10, 0x20]).unwrap();
        assert_eq!(
            format_packet(TransportKind::Modbus, &packet, false).unwrap(),
            "Modbus RTU [2] 10 20"
        );

        let line = format_packet(TransportKind::Rs232, &packet, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["transport"], "rs232");
        assert_eq!(value["len"], 2);
        assert_eq!(value["data"], "10 20");
    }
}
