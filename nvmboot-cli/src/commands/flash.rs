//! Program, verify and erase commands.
//!
//! All three run the block manager against a file-backed [`SimFlash`]. The
//! file holds the flash contents from the lowest to the highest address of
//! the sector table and is created erased when missing.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use nvmboot::{BlockManager, FlashConfig, NoCrypto, SectorTable, SimFlash};
use std::fs;
use std::io::IsTerminal;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, ensure_not_interrupted};

/// Call `$func::<N>` with the write block size `$size` as const generic.
macro_rules! with_block_size {
    ($size:expr, $func:ident($($arg:expr),* $(,)?)) => {
        match $size {
            256 => $func::<256>($($arg),*),
            512 => $func::<512>($($arg),*),
            1024 => $func::<1024>($($arg),*),
            2048 => $func::<2048>($($arg),*),
            other => Err(anyhow::Error::from(CliError::Usage(format!(
                "unsupported write block size {other}"
            )))),
        }
    };
}

/// How an image is programmed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgramJob {
    /// Start address, `None` for the user program base.
    pub(crate) address: Option<u32>,
    /// Bytes per write call.
    pub(crate) chunk: usize,
    /// Erase the target range first.
    pub(crate) erase: bool,
    /// Write the signature checksum before finishing.
    pub(crate) checksum: bool,
}

/// Result of a programming session.
struct ProgramReport {
    flash: SimFlash,
    address: u32,
    interrupted: bool,
    checksum_valid: bool,
}

/// Number of bytes covered by a flash image file.
fn flash_span(table: &SectorTable) -> Result<usize> {
    let span = u64::from(table.highest_address() - table.lowest_start()) + 1;
    usize::try_from(span).context("Sector table does not fit in memory")
}

/// Load the flash image file, or an erased flash if it does not exist yet.
pub(crate) fn open_flash(path: &Path, table: &SectorTable) -> Result<SimFlash> {
    let len = flash_span(table)?;
    let base = table.lowest_start();
    if !path.exists() {
        debug!("Creating erased flash image {} ({len} bytes)", path.display());
        return Ok(SimFlash::new(base, len));
    }

    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read flash image {}", path.display()))?;
    if bytes.len() != len {
        return Err(CliError::Usage(format!(
            "{} holds {} bytes but the sector table spans {len} bytes",
            path.display(),
            bytes.len()
        ))
        .into());
    }
    debug!("Loaded flash image {} at {base:#010x}", path.display());
    Ok(SimFlash::from_bytes(base, bytes))
}

fn save_flash(path: &Path, flash: &SimFlash) -> Result<()> {
    fs::write(path, flash.as_bytes())
        .with_context(|| format!("Failed to write flash image {}", path.display()))
}

fn progress_bar(quiet: bool, len: u64) -> ProgressBar {
    if quiet || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn program<const N: usize>(
    flash: SimFlash,
    layout: &FlashConfig,
    image: &[u8],
    job: &ProgramJob,
    pb: &ProgressBar,
) -> Result<ProgramReport> {
    let mut nvm: BlockManager<SimFlash, NoCrypto, N> =
        BlockManager::new(flash, layout.sector_table()?, layout.checksum)?;
    nvm.init();

    let address = job.address.unwrap_or_else(|| nvm.user_program_base());
    let len = u32::try_from(image.len()).context("Image larger than 4 GiB")?;

    if job.erase {
        pb.set_message("erasing");
        nvm.erase(address, len)
            .with_context(|| format!("Failed to erase {address:#010x}+{len:#x}"))?;
    }

    pb.set_message("programming");
    let mut offset = 0u32;
    for chunk in image.chunks(job.chunk) {
        if ensure_not_interrupted().is_err() {
            // Whatever is still buffered is lost, as on a power failure.
            warn!(
                "Interrupted at {:#010x}, session left incomplete",
                address.saturating_add(offset)
            );
            let checksum_valid = nvm.verify_checksum();
            return Ok(ProgramReport {
                flash: nvm.into_driver(),
                address,
                interrupted: true,
                checksum_valid,
            });
        }
        nvm.write(address.saturating_add(offset), chunk)?;
        // Chunks are at most the image length, which fits in u32.
        #[allow(clippy::cast_possible_truncation)]
        let step = chunk.len() as u32;
        offset += step;
        pb.inc(u64::from(step));
    }

    if job.checksum {
        pb.set_message("signing");
        nvm.write_checksum()?;
    }
    nvm.done()?;

    let checksum_valid = nvm.verify_checksum();
    Ok(ProgramReport {
        flash: nvm.into_driver(),
        address,
        interrupted: false,
        checksum_valid,
    })
}

fn verify<const N: usize>(flash: SimFlash, layout: &FlashConfig) -> Result<(u32, bool)> {
    let mut nvm: BlockManager<SimFlash, NoCrypto, N> =
        BlockManager::new(flash, layout.sector_table()?, layout.checksum)?;
    Ok((nvm.user_program_base(), nvm.verify_checksum()))
}

fn erase<const N: usize>(
    flash: SimFlash,
    layout: &FlashConfig,
    range: Option<(u32, u32)>,
) -> Result<SimFlash> {
    let table = layout.sector_table()?;
    let mut nvm: BlockManager<SimFlash, NoCrypto, N> =
        BlockManager::new(flash, table.clone(), layout.checksum)?;
    match range {
        Some((address, len)) => nvm.erase(address, len)?,
        // Sector by sector, the table may have gaps.
        None => {
            for sector in table.sectors() {
                nvm.erase(sector.start, sector.size)?;
            }
        },
    }
    Ok(nvm.into_driver())
}

/// Program command implementation.
pub(crate) fn cmd_program(
    cli: &Cli,
    config: &Config,
    image: &Path,
    flash_path: &Path,
    job: &ProgramJob,
) -> Result<()> {
    if job.chunk == 0 {
        return Err(CliError::Usage("--chunk must be at least 1".to_string()).into());
    }

    let layout = config.boot()?.flash;
    let data =
        fs::read(image).with_context(|| format!("Failed to read image {}", image.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", image.display())).into());
    }

    let flash = open_flash(flash_path, &layout.sector_table()?)?;
    let pb = progress_bar(cli.quiet, data.len() as u64);
    let report = with_block_size!(
        layout.write_block_size,
        program(flash, &layout, &data, job, &pb)
    )?;
    pb.finish_and_clear();

    debug!(
        "{} blocks programmed, {} sectors erased",
        report.flash.program_log().len(),
        report.flash.erase_log().len()
    );
    save_flash(flash_path, &report.flash)?;

    if report.interrupted {
        return Err(CliError::Cancelled(format!(
            "programming interrupted, session in {} left incomplete",
            flash_path.display()
        ))
        .into());
    }

    info!(
        "Programmed {} bytes at {:#010x} into {}",
        data.len(),
        report.address,
        flash_path.display()
    );
    if !cli.quiet {
        if report.checksum_valid {
            eprintln!("✓ Signature valid");
        } else {
            eprintln!("! Signature not valid, the bootloader will not start this image");
        }
    }
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(cli: &Cli, config: &Config, flash_path: &Path, json: bool) -> Result<()> {
    let layout = config.boot()?.flash;
    if !flash_path.exists() {
        return Err(CliError::Usage(format!("{} does not exist", flash_path.display())).into());
    }
    let flash = open_flash(flash_path, &layout.sector_table()?)?;
    let (base, valid) = with_block_size!(layout.write_block_size, verify(flash, &layout))?;

    if json {
        let output = serde_json::json!({
            "ok": valid,
            "data": {
                "flash": flash_path.display().to_string(),
                "user_program_base": format!("{base:#010x}"),
                "checksum_offset": format!("{:#x}", layout.checksum.offset),
                "valid": valid,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !cli.quiet && valid {
        eprintln!("✓ Signature valid at {base:#010x}");
    }

    if valid {
        Ok(())
    } else {
        Err(CliError::InvalidImage(format!(
            "signature of {} is not valid",
            flash_path.display()
        ))
        .into())
    }
}

/// Erase command implementation. `None` erases every sector.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &Config,
    flash_path: &Path,
    range: Option<(u32, u32)>,
) -> Result<()> {
    let layout = config.boot()?.flash;
    let flash = open_flash(flash_path, &layout.sector_table()?)?;
    let flash = with_block_size!(layout.write_block_size, erase(flash, &layout, range))?;
    save_flash(flash_path, &flash)?;

    if !cli.quiet {
        eprintln!("✓ Erased {} sector(s)", flash.erase_log().len());
    }
    Ok(())
}
