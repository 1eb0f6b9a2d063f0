//! nvmboot CLI - host harness for the nvmboot bootloader core.
//!
//! ## Features
//!
//! - Program a binary image into a file-backed simulated flash
//! - Verify the vector-table signature of a flash image
//! - Erase sectors of a flash image
//! - Show the configured sector layout
//! - Listen for packets on a serial port (RS-232 framing or Modbus RTU)
//! - TOML configuration and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Set by the Ctrl-C handler, polled by long-running commands.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether Ctrl-C was pressed since the flag was last cleared.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Reset the Ctrl-C flag.
pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Fail with [`CliError::Cancelled`] once Ctrl-C was pressed.
pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or inconsistent inputs.
    #[error("{0}")]
    Usage(String),
    /// The user interrupted the command.
    #[error("{0}")]
    Cancelled(String),
    /// The flash image does not carry a valid signature.
    #[error("{0}")]
    InvalidImage(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::InvalidImage(_) => 3,
            Self::Cancelled(_) => 130,
        }
    }
}

/// nvmboot - run the bootloader core against simulated flash or a serial port.
///
/// Environment variables:
///   NVMBOOT_PORT   - Serial port for `listen`
///   NVMBOOT_BAUD   - Baud rate for `listen`
#[derive(Parser)]
#[command(name = "nvmboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "NVMBOOT_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate for the serial port.
    #[arg(short, long, global = true, env = "NVMBOOT_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Transport used by `listen`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ListenTransport {
    /// Length-prefixed packets.
    Rs232,
    /// Modbus RTU frames (RTS switches the RS-485 driver).
    Modbus,
}

#[derive(Subcommand)]
enum Commands {
    /// Program a binary image into a flash image file.
    Program {
        /// Binary image to program.
        image: PathBuf,

        /// Flash image file (created erased if missing).
        #[arg(long, value_name = "FILE")]
        flash: PathBuf,

        /// Start address (defaults to the user program base).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Bytes handed to the block manager per write call.
        #[arg(long, default_value_t = 64)]
        chunk: usize,

        /// Do not erase the target range first.
        #[arg(long)]
        no_erase: bool,

        /// Do not write the signature checksum.
        #[arg(long)]
        no_checksum: bool,
    },

    /// Check the signature checksum of a flash image file.
    Verify {
        /// Flash image file.
        #[arg(long, value_name = "FILE")]
        flash: PathBuf,

        /// Output the result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase sectors of a flash image file.
    Erase {
        /// Flash image file (created erased if missing).
        #[arg(long, value_name = "FILE")]
        flash: PathBuf,

        /// Erase every sector of the table.
        #[arg(long, conflicts_with_all = ["address", "length"])]
        all: bool,

        /// First address of the range to erase.
        #[arg(short, long, value_parser = parse_hex_u32, requires = "length")]
        address: Option<u32>,

        /// Length of the range to erase.
        #[arg(short, long, value_parser = parse_hex_u32, requires = "address")]
        length: Option<u32>,
    },

    /// Show the configured flash layout.
    Layout {
        /// Output the layout as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Receive packets on a serial port and print them.
    Listen {
        /// Transport protocol on the port.
        #[arg(short, long, value_enum, default_value = "rs232")]
        transport: ListenTransport,

        /// Send every received packet back.
        #[arg(long)]
        echo: bool,

        /// Drive RTS low to enable the RS-485 transmitter.
        #[arg(long)]
        rts_active_low: bool,

        /// Stop after this many packets.
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Print packets as JSON lines to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x0800_2000
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "nvmboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err
                .downcast_ref::<CliError>()
                .map_or(1, CliError::exit_code);
            ExitCode::from(code)
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Program {
            image,
            flash,
            address,
            chunk,
            no_erase,
            no_checksum,
        } => {
            let job = commands::flash::ProgramJob {
                address: *address,
                chunk: *chunk,
                erase: !*no_erase,
                checksum: !*no_checksum,
            };
            commands::flash::cmd_program(cli, &config, image, flash, &job)
        },
        Commands::Verify { flash, json } => commands::flash::cmd_verify(cli, &config, flash, *json),
        Commands::Erase {
            flash,
            all,
            address,
            length,
        } => {
            let range = match (*all, *address, *length) {
                (true, _, _) => None,
                (false, Some(address), Some(length)) => Some((address, length)),
                _ => {
                    return Err(CliError::Usage(
                        "specify --all or both --address and --length".to_string(),
                    )
                    .into());
                },
            };
            commands::flash::cmd_erase(cli, &config, flash, range)
        },
        Commands::Layout { json } => commands::layout::cmd_layout(&config, *json),
        Commands::Listen {
            transport,
            echo,
            rts_active_low,
            count,
            json,
        } => {
            let options = commands::listen::ListenOptions {
                transport: *transport,
                echo: *echo,
                rts_active_low: *rts_active_low,
                count: *count,
                json: *json,
            };
            let result = commands::listen::cmd_listen(cli, &config, &options);
            clear_interrupted_flag();
            result
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x0800_2000"), Ok(0x0800_2000));
        assert_eq!(parse_hex_u32("200"), Ok(0x200));
        assert_eq!(parse_hex_u32(" 0XFF "), Ok(0xFF));
        assert!(parse_hex_u32("0xZZ").is_err());
        assert!(parse_hex_u32("").is_err());
    }

    #[test]
    fn test_erase_flags_conflict() {
        let result = Cli::try_parse_from(["nvmboot", "erase", "--flash", "f.bin", "--all", "-a", "0"]);
        assert!(result.is_err());
        let result = Cli::try_parse_from(["nvmboot", "erase", "--flash", "f.bin", "-a", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_listen_defaults() {
        let cli = Cli::try_parse_from(["nvmboot", "listen"]).unwrap();
        match cli.command {
            Commands::Listen {
                transport, echo, ..
            } => {
                assert_eq!(transport, ListenTransport::Rs232);
                assert!(!echo);
            },
            _ => panic!("expected listen"),
        }
    }

    #[test]
    fn test_cli_error_exit_codes() {
        assert_eq!(CliError::Usage(String::new()).exit_code(), 2);
        assert_eq!(CliError::InvalidImage(String::new()).exit_code(), 3);
        assert_eq!(CliError::Cancelled(String::new()).exit_code(), 130);
    }
}
