//! Flash sector layout.
//!
//! The sector table lists only the sectors the bootloader may touch. Sectors
//! reserved for the bootloader itself are simply left out, which is what
//! keeps every write and erase away from them. Entries may leave gaps and
//! need not be sorted.

use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, Result};

/// One erasable flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectorDescriptor {
    /// First address of the sector.
    pub start: u32,
    /// Size of the sector in bytes.
    pub size: u32,
    /// Hardware sector (or page) identifier used by the erase command.
    pub id: u32,
    /// Hardware bank identifier, for dual-bank parts.
    #[cfg_attr(feature = "serde", serde(default))]
    pub bank: u8,
}

impl SectorDescriptor {
    /// Create a sector descriptor in bank 0.
    pub const fn new(start: u32, size: u32, id: u32) -> Self {
        Self {
            start,
            size,
            id,
            bank: 0,
        }
    }

    /// Set the bank identifier.
    #[must_use]
    pub const fn in_bank(mut self, bank: u8) -> Self {
        self.bank = bank;
        self
    }

    /// Last address inside the sector.
    pub fn last_address(&self) -> u32 {
        self.start.saturating_add(self.size.saturating_sub(1))
    }

    /// Whether `address` lies inside this sector.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address <= self.last_address()
    }
}

impl fmt::Display for SectorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sector {} (bank {}) @ {:#010x}..={:#010x}",
            self.id,
            self.bank,
            self.start,
            self.last_address()
        )
    }
}

/// Immutable per-target sector table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorTable {
    sectors: Cow<'static, [SectorDescriptor]>,
    lowest_start: u32,
}

impl SectorTable {
    /// Build a table, checking that it is non-empty, that no sector is empty
    /// or runs past the 32-bit address space, and that sectors do not overlap.
    pub fn new(sectors: impl Into<Cow<'static, [SectorDescriptor]>>) -> Result<Self> {
        let sectors = sectors.into();

        if sectors.is_empty() {
            return Err(Error::Config("sector table is empty".into()));
        }

        for sector in sectors.iter() {
            if sector.size == 0 {
                return Err(Error::Config(format!("sector {} has zero size", sector.id)));
            }
            if sector.start.checked_add(sector.size - 1).is_none() {
                return Err(Error::Config(format!(
                    "sector {} runs past the end of the address space",
                    sector.id
                )));
            }
        }

        for (i, a) in sectors.iter().enumerate() {
            for b in &sectors[i + 1..] {
                if a.start <= b.last_address() && b.start <= a.last_address() {
                    return Err(Error::Config(format!(
                        "sectors {} and {} overlap",
                        a.id, b.id
                    )));
                }
            }
        }

        let lowest_start = sectors.iter().map(|s| s.start).min().unwrap_or_default();

        Ok(Self {
            sectors,
            lowest_start,
        })
    }

    /// All sectors in table order.
    pub fn sectors(&self) -> &[SectorDescriptor] {
        &self.sectors
    }

    /// Lowest start address in the table. The user program (and its vector
    /// table) begins here.
    pub fn lowest_start(&self) -> u32 {
        self.lowest_start
    }

    /// Highest last address in the table.
    pub fn highest_address(&self) -> u32 {
        self.sectors
            .iter()
            .map(SectorDescriptor::last_address)
            .max()
            .unwrap_or_default()
    }

    /// Sum of all sector sizes.
    pub fn total_size(&self) -> u64 {
        self.sectors.iter().map(|s| u64::from(s.size)).sum()
    }

    /// Index of the sector containing `address`.
    pub fn index_of(&self, address: u32) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains(address))
    }

    /// Sector containing `address`.
    pub fn find(&self, address: u32) -> Option<&SectorDescriptor> {
        self.sectors.iter().find(|s| s.contains(address))
    }

    /// Whether every byte of `[address, address + len)` lies inside some
    /// sector. Empty and overflowing ranges are never covered.
    pub fn covers(&self, address: u32, len: u32) -> bool {
        let Some(last) = len.checked_sub(1).and_then(|n| address.checked_add(n)) else {
            return false;
        };

        let mut cursor = address;
        loop {
            let Some(sector) = self.find(cursor) else {
                return false;
            };
            let sector_last = sector.last_address();
            if sector_last >= last {
                return true;
            }
            cursor = sector_last + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &[SectorDescriptor] = &[
        SectorDescriptor::new(0x0800_4000, 0x4000, 1),
        SectorDescriptor::new(0x0800_8000, 0x4000, 2),
        // Gap: 0x0800_C000..0x0801_0000 reserved.
        SectorDescriptor::new(0x0801_0000, 0x1_0000, 4),
    ];

    #[test]
    fn test_static_table() {
        let table = SectorTable::new(LAYOUT).unwrap();
        assert_eq!(table.lowest_start(), 0x0800_4000);
        assert_eq!(table.highest_address(), 0x0801_FFFF);
        assert_eq!(table.total_size(), 0x1_8000);
    }

    #[test]
    fn test_lowest_start_ignores_table_order() {
        let table = SectorTable::new(vec![
            SectorDescriptor::new(0x0800_8000, 0x4000, 2),
            SectorDescriptor::new(0x0800_4000, 0x4000, 1),
        ])
        .unwrap();
        assert_eq!(table.lowest_start(), 0x0800_4000);
        assert_eq!(table.index_of(0x0800_4000), Some(1));
    }

    #[test]
    fn test_covers_spans_adjacent_sectors() {
        let table = SectorTable::new(LAYOUT).unwrap();
        assert!(table.covers(0x0800_7FF0, 0x20));
        assert!(table.covers(0x0800_4000, 0x8000));
    }

    #[test]
    fn test_covers_rejects_gap_and_outside() {
        let table = SectorTable::new(LAYOUT).unwrap();
        // Both ends inside sectors, gap in between.
        assert!(!table.covers(0x0800_BFF0, 0x4020));
        assert!(!table.covers(0x0800_3FFF, 2));
        assert!(!table.covers(0x0801_FFFF, 2));
        assert!(!table.covers(0x0800_4000, 0));
        assert!(!table.covers(u32::MAX, 2));
    }

    #[test]
    fn test_rejects_overlap_and_empty() {
        assert!(SectorTable::new(Vec::<SectorDescriptor>::new()).is_err());
        let overlap = vec![
            SectorDescriptor::new(0x1000, 0x1000, 0),
            SectorDescriptor::new(0x1800, 0x1000, 1),
        ];
        assert!(matches!(SectorTable::new(overlap), Err(Error::Config(_))));
        let zero = vec![SectorDescriptor::new(0x1000, 0, 0)];
        assert!(SectorTable::new(zero).is_err());
        let wrap = vec![SectorDescriptor::new(0xFFFF_F000, 0x2000, 0)];
        assert!(SectorTable::new(wrap).is_err());
    }

    #[test]
    fn test_descriptor_display() {
        let s = SectorDescriptor::new(0x0800_4000, 0x4000, 1).in_bank(2);
        assert_eq!(
            s.to_string(),
            "sector 1 (bank 2) @ 0x08004000..=0x08007fff"
        );
    }
}
