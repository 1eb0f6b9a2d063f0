//! NVM block manager.
//!
//! Incoming writes are buffered in write-block sized RAM images and only
//! programmed when the writer moves on to another block or the session ends.
//! Two images exist:
//!
//! - the **generic block**, reused for every block of the user program
//!   except the first one;
//! - the **boot block**, the block at the lowest sector address. It holds
//!   the vector table and the signature checksum and is programmed by
//!   [`BlockManager::done`] only, after the checksum has been merged into its
//!   RAM image and after the generic block. A power loss at any earlier
//!   point leaves the stored checksum invalid, so the bootloader stays
//!   resident on the next reset.
//!
//! ```text
//!  write(addr) --> block base == lowest sector? --yes--> boot block (deferred)
//!                        |
//!                        no
//!                        v
//!                  generic block --(base changes)--> program + verify, reopen
//! ```

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::hal::{CryptoHook, NoCrypto, NvmDriver};
use crate::nvm::block::{DEFAULT_WRITE_BLOCK_SIZE, FlashBlock};
use crate::nvm::checksum::ChecksumConfig;
use crate::nvm::layout::SectorTable;

/// Which of the two RAM images an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Generic,
    Boot,
}

/// Buffers, programs and verifies flash write blocks for one update session.
pub struct BlockManager<D, C = NoCrypto, const N: usize = DEFAULT_WRITE_BLOCK_SIZE> {
    driver: D,
    crypto: C,
    table: SectorTable,
    checksum: ChecksumConfig,
    generic: FlashBlock<N>,
    boot: FlashBlock<N>,
}

impl<D: NvmDriver, const N: usize> BlockManager<D, NoCrypto, N> {
    /// Create a block manager without a crypto hook.
    ///
    /// Fails with [`Error::Config`] when the layout and checksum settings
    /// cannot work together (see [`BlockManager::with_crypto`]).
    pub fn new(driver: D, table: SectorTable, checksum: ChecksumConfig) -> Result<Self> {
        Self::with_crypto(driver, NoCrypto, table, checksum)
    }
}

impl<D: NvmDriver, C: CryptoHook, const N: usize> BlockManager<D, C, N> {
    /// Create a block manager that passes every block image through
    /// `crypto` right before it is committed.
    ///
    /// The lowest sector must start on a write-block boundary, and the
    /// checksum word and summed vector table must lie inside that first
    /// block and inside the sector table.
    pub fn with_crypto(
        driver: D,
        crypto: C,
        table: SectorTable,
        checksum: ChecksumConfig,
    ) -> Result<Self> {
        if N == 0 || u32::try_from(N).is_err() {
            return Err(Error::Config(format!("unsupported write block size {N}")));
        }
        let boot_base = table.lowest_start();
        if FlashBlock::<N>::align(boot_base) != boot_base {
            return Err(Error::Config(format!(
                "user program base {boot_base:#010x} is not aligned to the {N}-byte write block"
            )));
        }
        checksum.validate(N)?;
        #[allow(clippy::cast_possible_truncation)] // bounded by N, checked above
        let field_len = checksum.width.bytes() as u32;
        if !table.covers(boot_base + checksum.offset, field_len) {
            return Err(Error::Config(format!(
                "checksum field at {:#010x} is outside the sector table",
                boot_base + checksum.offset
            )));
        }

        Ok(Self {
            driver,
            crypto,
            table,
            checksum,
            generic: FlashBlock::new(),
            boot: FlashBlock::new(),
        })
    }

    /// Reset both block images. Pending data is discarded; flash is not
    /// touched.
    pub fn init(&mut self) {
        self.generic.invalidate();
        self.boot.invalidate();
    }

    /// Buffer `data` for programming at `address`.
    ///
    /// Fails with [`Error::Range`] unless every byte of the range lies inside
    /// the sector table. A write may span any number of write blocks; each
    /// block left behind is programmed and verified on the way, except the
    /// boot block.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::Range {
            address,
            len: u32::MAX,
        })?;
        if !self.table.covers(address, len) {
            return Err(Error::Range { address, len });
        }

        let slot = if FlashBlock::<N>::align(address) == self.boot_base() {
            Slot::Boot
        } else {
            Slot::Generic
        };
        trace!("write {len} bytes at {address:#010x} via {slot:?} block");
        self.add_to_block(slot, address, data)
    }

    /// Erase every sector that intersects `address..address + len`, in
    /// ascending address order.
    ///
    /// Both the first and the last byte of the range must lie inside a
    /// sector; gaps in between are skipped. The table may be unsorted.
    /// Not transactional: sectors erased before a failure stay erased.
    pub fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        let range = || Error::Range { address, len };
        let last = len
            .checked_sub(1)
            .and_then(|n| address.checked_add(n))
            .ok_or_else(range)?;
        if self.table.find(address).is_none() || self.table.find(last).is_none() {
            return Err(range());
        }

        let mut hit: Vec<_> = self
            .table
            .sectors()
            .iter()
            .filter(|s| s.start <= last && address <= s.last_address())
            .copied()
            .collect();
        hit.sort_unstable_by_key(|s| s.start);

        for sector in &hit {
            debug!("Erasing {sector}");
            self.driver.erase_sector(sector)?;
        }
        Ok(())
    }

    /// Merge the signature checksum into the boot block image.
    ///
    /// Does nothing when the boot block was not written this session. The
    /// checksum is written through [`write`](Self::write) so it lands in the
    /// already open boot block and is programmed together with the vector
    /// table by [`done`](Self::done).
    pub fn write_checksum(&mut self) -> Result<()> {
        let Some(base) = self.boot.base() else {
            debug!("Boot block untouched this session, no checksum written");
            return Ok(());
        };

        // The checksum must cover plaintext vectors.
        if self.crypto.is_active() && !self.boot.is_decrypted() {
            if !self.crypto.decrypt_in_place(base, self.boot.data_mut()) {
                return Err(Error::Decrypt { address: base });
            }
            self.boot.mark_decrypted();
        }

        let (bytes, len) = self.checksum.signature_bytes(self.boot.data());
        debug!(
            "Signature checksum {:02X?} at {:#010x}",
            &bytes[..len],
            base + self.checksum.offset
        );
        self.write(base + self.checksum.offset, &bytes[..len])
    }

    /// Check the signature checksum stored in physical flash.
    ///
    /// Returns `true` only after a session completed with
    /// [`write_checksum`](Self::write_checksum) and [`done`](Self::done).
    /// Read errors count as an invalid checksum.
    pub fn verify_checksum(&mut self) -> bool {
        let base = self.boot_base();
        let vector_len = self.checksum.vector_len();
        let width = self.checksum.width.bytes();
        let mut vectors = [0u8; N];
        let mut stored = [0u8; 4];

        if self.driver.read(base, &mut vectors[..vector_len]).is_err()
            || self
                .driver
                .read(base + self.checksum.offset, &mut stored[..width])
                .is_err()
        {
            return false;
        }
        self.checksum.verify(&vectors[..vector_len], &stored[..width])
    }

    /// Program whatever is still buffered: the generic block first, the boot
    /// block last.
    pub fn done(&mut self) -> Result<()> {
        self.flush(Slot::Generic)?;
        self.flush(Slot::Boot)
    }

    /// Start address of the user program (its vector table).
    pub fn user_program_base(&self) -> u32 {
        self.boot_base()
    }

    /// Last address the user program may occupy.
    pub fn user_program_end(&self) -> u32 {
        self.table.highest_address()
    }

    /// Number of programmable bytes in the sector table.
    pub fn total_size(&self) -> u64 {
        self.table.total_size()
    }

    /// Sector table in use.
    pub fn table(&self) -> &SectorTable {
        &self.table
    }

    /// Checksum settings in use.
    pub fn checksum_config(&self) -> &ChecksumConfig {
        &self.checksum
    }

    /// Whether the boot block holds buffered data.
    pub fn is_boot_block_open(&self) -> bool {
        self.boot.is_open()
    }

    /// Base address of the open generic block.
    pub fn generic_block_base(&self) -> Option<u32> {
        self.generic.base()
    }

    /// Borrow the NVM driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutably borrow the NVM driver.
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Consume the manager and return the NVM driver. Buffered data is
    /// dropped.
    pub fn into_driver(self) -> D {
        self.driver
    }

    fn boot_base(&self) -> u32 {
        self.table.lowest_start()
    }

    fn block(&self, slot: Slot) -> &FlashBlock<N> {
        match slot {
            Slot::Generic => &self.generic,
            Slot::Boot => &self.boot,
        }
    }

    fn add_to_block(&mut self, slot: Slot, address: u32, data: &[u8]) -> Result<()> {
        let mut slot = slot;
        let mut base = FlashBlock::<N>::align(address);

        if !self.block(slot).is_open() {
            self.open_block(slot, base)?;
        } else if !self.block(slot).is_open_at(base) {
            slot = self.switch_block(slot, base)?;
        }

        let mut offset = (address - base) as usize;
        let mut remaining = data;
        while !remaining.is_empty() {
            if offset == N {
                #[allow(clippy::cast_possible_truncation)] // N fits u32, checked in ctor
                let next = base.checked_add(N as u32).ok_or_else(|| Error::Range {
                    address,
                    len: u32::try_from(data.len()).unwrap_or(u32::MAX),
                })?;
                base = next;
                slot = self.switch_block(slot, base)?;
                offset = 0;
            }

            let copied = match slot {
                Slot::Generic => self.generic.fill(offset, remaining),
                Slot::Boot => self.boot.fill(offset, remaining),
            };
            offset += copied;
            remaining = &remaining[copied..];
        }
        Ok(())
    }

    /// Move on to the block at `new_base` and return the slot that now
    /// buffers it.
    ///
    /// Cases, in order of precedence:
    /// 1. leaving the boot block: it stays open and unprogrammed, the
    ///    generic block takes over;
    /// 2. entering the boot block: the generic block stays open, the boot
    ///    block takes over;
    /// 3. otherwise the generic block is programmed and reopened.
    ///
    /// The generic block is never re-targeted while holding data for another
    /// base; that data is programmed first.
    fn switch_block(&mut self, from: Slot, new_base: u32) -> Result<Slot> {
        let to = if from == Slot::Boot {
            Slot::Generic
        } else if new_base == self.boot_base() {
            Slot::Boot
        } else {
            Slot::Generic
        };

        if to == Slot::Generic {
            match self.generic.base() {
                Some(open) if open != new_base => self.flush(Slot::Generic)?,
                _ => {},
            }
        }

        self.open_block(to, new_base)?;
        Ok(to)
    }

    /// Open `slot` at `base` by copying the current flash contents, unless it
    /// is open there already.
    fn open_block(&mut self, slot: Slot, base: u32) -> Result<()> {
        let block = match slot {
            Slot::Generic => &mut self.generic,
            Slot::Boot => &mut self.boot,
        };
        if block.is_open_at(base) {
            return Ok(());
        }

        debug!("Opening {slot:?} block at {base:#010x}");
        let buf = block.open(base);
        if let Err(e) = self.driver.read(base, buf) {
            block.invalidate();
            return Err(e);
        }
        Ok(())
    }

    /// Decrypt (once), program and read back the block in `slot`, then close
    /// it. A closed block is a no-op.
    fn flush(&mut self, slot: Slot) -> Result<()> {
        let block = match slot {
            Slot::Generic => &mut self.generic,
            Slot::Boot => &mut self.boot,
        };
        let Some(base) = block.base() else {
            return Ok(());
        };

        if self.table.find(base).is_none() {
            #[allow(clippy::cast_possible_truncation)] // N fits u32, checked in ctor
            return Err(Error::Range {
                address: base,
                len: N as u32,
            });
        }

        if self.crypto.is_active() && !block.is_decrypted() {
            if !self.crypto.decrypt_in_place(base, block.data_mut()) {
                return Err(Error::Decrypt { address: base });
            }
            block.mark_decrypted();
        }

        debug!("Programming {slot:?} block at {base:#010x}");
        self.driver.program_block(base, block.data())?;

        let mut readback = [0u8; N];
        self.driver.read(base, &mut readback)?;
        if let Some(pos) = readback
            .iter()
            .zip(block.data().iter())
            .position(|(a, b)| a != b)
        {
            #[allow(clippy::cast_possible_truncation)] // pos < N
            return Err(Error::VerifyMismatch {
                address: base + pos as u32,
            });
        }

        block.invalidate();
        Ok(())
    }
}
