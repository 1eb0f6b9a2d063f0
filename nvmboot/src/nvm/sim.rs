//! Simulated NOR flash.
//!
//! Behaves like a real NOR array: erased cells read 0xFF and programming can
//! only clear bits, so programming over non-erased data shows up as a
//! read-back mismatch. Every program and erase is logged, and individual
//! operations can be made to fail, which is what the session tests and the
//! CLI harness build on.

use std::collections::HashSet;

use log::trace;

use crate::error::{Error, Result};
use crate::hal::NvmDriver;
use crate::nvm::SectorDescriptor;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// File- or memory-backed flash model covering `[base, base + len)`.
#[derive(Debug, Clone)]
pub struct SimFlash {
    base: u32,
    memory: Vec<u8>,
    program_log: Vec<u32>,
    erase_log: Vec<u32>,
    fail_program: HashSet<u32>,
    fail_erase: HashSet<u32>,
}

impl SimFlash {
    /// Fully erased flash of `len` bytes starting at `base`.
    pub fn new(base: u32, len: usize) -> Self {
        Self::from_bytes(base, vec![ERASED; len])
    }

    /// Flash preloaded with `memory`.
    pub fn from_bytes(base: u32, memory: Vec<u8>) -> Self {
        Self {
            base,
            memory,
            program_log: Vec::new(),
            erase_log: Vec::new(),
            fail_program: HashSet::new(),
            fail_erase: HashSet::new(),
        }
    }

    /// First modelled address.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Raw contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Base addresses of all successful `program_block` calls, in order.
    pub fn program_log(&self) -> &[u32] {
        &self.program_log
    }

    /// Sector ids of all successful `erase_sector` calls, in order.
    pub fn erase_log(&self) -> &[u32] {
        &self.erase_log
    }

    /// Make programming the block at `address` fail.
    pub fn fail_program_at(&mut self, address: u32) {
        self.fail_program.insert(address);
    }

    /// Make erasing sector `id` fail.
    pub fn fail_erase_of(&mut self, id: u32) {
        self.fail_erase.insert(id);
    }

    /// Read back a copy of `len` bytes at `address`.
    pub fn read_vec(&self, address: u32, len: usize) -> Result<Vec<u8>> {
        Ok(self.slice(address, len)?.to_vec())
    }

    fn offset(&self, address: u32, len: usize) -> Result<usize> {
        let out_of_range = || Error::Range {
            address,
            len: u32::try_from(len).unwrap_or(u32::MAX),
        };
        let offset = address
            .checked_sub(self.base)
            .map(|o| o as usize)
            .ok_or_else(out_of_range)?;
        if offset + len > self.memory.len() {
            return Err(out_of_range());
        }
        Ok(offset)
    }

    fn slice(&self, address: u32, len: usize) -> Result<&[u8]> {
        let offset = self.offset(address, len)?;
        Ok(&self.memory[offset..offset + len])
    }
}

impl NvmDriver for SimFlash {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.slice(address, buf.len())?);
        Ok(())
    }

    fn program_block(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if self.fail_program.contains(&address) {
            return Err(Error::Program { address });
        }
        let offset = self.offset(address, data.len())?;
        trace!("sim: program {} bytes at {address:#010x}", data.len());
        for (cell, byte) in self.memory[offset..offset + data.len()]
            .iter_mut()
            .zip(data)
        {
            *cell &= *byte;
        }
        self.program_log.push(address);
        Ok(())
    }

    fn erase_sector(&mut self, sector: &SectorDescriptor) -> Result<()> {
        if self.fail_erase.contains(&sector.id) {
            return Err(Error::Erase { sector: sector.id });
        }
        let offset = self
            .offset(sector.start, sector.size as usize)
            .map_err(|_| Error::Erase { sector: sector.id })?;
        trace!("sim: erase {sector}");
        self.memory[offset..offset + sector.size as usize].fill(ERASED);
        self.erase_log.push(sector.id);
        Ok(())
    }
}
