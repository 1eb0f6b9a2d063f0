//! Vector-table signature checksum.
//!
//! The checksum is the two's complement of the sum of the first
//! `vector_words` words of the user program. Adding the stored checksum to
//! that sum therefore yields zero, which is how a complete programming
//! session is recognised at startup.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Width of the checksum word and of the summed vector-table words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChecksumWidth {
    /// 16-bit words.
    U16,
    /// 32-bit words.
    #[default]
    U32,
}

impl ChecksumWidth {
    /// Width in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Byte order of words in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum WordOrder {
    /// Little endian (Cortex-M, TriCore).
    #[default]
    Little,
    /// Big endian (HCS12).
    Big,
}

/// Where the checksum lives and what it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ChecksumConfig {
    /// Byte offset of the checksum word from the user program base.
    pub offset: u32,
    /// Number of vector-table words summed into the checksum.
    pub vector_words: u16,
    /// Word width.
    pub width: ChecksumWidth,
    /// Word byte order.
    pub byte_order: WordOrder,
}

impl Default for ChecksumConfig {
    /// Cortex-M layout: seven 32-bit exception vectors, checksum at 0x1D8.
    fn default() -> Self {
        Self {
            offset: 0x1D8,
            vector_words: 7,
            width: ChecksumWidth::U32,
            byte_order: WordOrder::Little,
        }
    }
}

impl ChecksumConfig {
    /// Create a configuration with the given offset, using 32-bit
    /// little-endian words.
    pub fn new(offset: u32, vector_words: u16) -> Self {
        Self {
            offset,
            vector_words,
            ..Self::default()
        }
    }

    /// Set the word width.
    #[must_use]
    pub fn with_width(mut self, width: ChecksumWidth) -> Self {
        self.width = width;
        self
    }

    /// Set the word byte order.
    #[must_use]
    pub fn with_byte_order(mut self, byte_order: WordOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Number of bytes covered by the summed vector table.
    pub fn vector_len(&self) -> usize {
        usize::from(self.vector_words) * self.width.bytes()
    }

    /// Check that vector table and checksum word both fit in the first write
    /// block of `block_size` bytes and do not overlap.
    pub fn validate(&self, block_size: usize) -> Result<()> {
        if self.vector_words == 0 {
            return Err(Error::Config("checksum covers zero vector words".into()));
        }
        let offset = usize::try_from(self.offset)
            .map_err(|_| Error::Config("checksum offset out of range".into()))?;
        if offset % self.width.bytes() != 0 {
            return Err(Error::Config(format!(
                "checksum offset {offset:#x} is not aligned to its {}-byte width",
                self.width.bytes()
            )));
        }
        if offset + self.width.bytes() > block_size {
            return Err(Error::Config(format!(
                "checksum offset {offset:#x} must lie inside the first {block_size}-byte write block"
            )));
        }
        if self.vector_len() > block_size {
            return Err(Error::Config(format!(
                "vector table of {} bytes exceeds the {block_size}-byte write block",
                self.vector_len()
            )));
        }
        if offset < self.vector_len() {
            return Err(Error::Config(format!(
                "checksum offset {offset:#x} overlaps the summed vector table"
            )));
        }
        Ok(())
    }

    /// Wrapping sum of the vector-table words at the start of `image`.
    ///
    /// `image` must hold at least [`vector_len`](Self::vector_len) bytes.
    pub fn vector_sum(&self, image: &[u8]) -> u32 {
        let step = self.width.bytes();
        image[..self.vector_len()]
            .chunks_exact(step)
            .map(|word| self.read_word(word))
            .fold(0u32, u32::wrapping_add)
            & self.mask()
    }

    /// Two's complement of the vector sum, encoded as the bytes to store.
    pub fn signature_bytes(&self, image: &[u8]) -> ([u8; 4], usize) {
        let checksum = self.vector_sum(image).wrapping_neg() & self.mask();
        let mut out = [0u8; 4];
        let len = self.width.bytes();
        self.write_word(&mut out[..len], checksum);
        (out, len)
    }

    /// Whether `vector_table` plus the stored `checksum` bytes sum to zero.
    pub fn verify(&self, vector_table: &[u8], checksum: &[u8]) -> bool {
        let total = self
            .vector_sum(vector_table)
            .wrapping_add(self.read_word(checksum));
        total & self.mask() == 0
    }

    fn mask(&self) -> u32 {
        match self.width {
            ChecksumWidth::U16 => 0xFFFF,
            ChecksumWidth::U32 => u32::MAX,
        }
    }

    fn read_word(&self, bytes: &[u8]) -> u32 {
        match (self.width, self.byte_order) {
            (ChecksumWidth::U16, WordOrder::Little) => u32::from(LittleEndian::read_u16(bytes)),
            (ChecksumWidth::U16, WordOrder::Big) => u32::from(BigEndian::read_u16(bytes)),
            (ChecksumWidth::U32, WordOrder::Little) => LittleEndian::read_u32(bytes),
            (ChecksumWidth::U32, WordOrder::Big) => BigEndian::read_u32(bytes),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // masked to 16 bits first
    fn write_word(&self, out: &mut [u8], value: u32) {
        match (self.width, self.byte_order) {
            (ChecksumWidth::U16, WordOrder::Little) => LittleEndian::write_u16(out, value as u16),
            (ChecksumWidth::U16, WordOrder::Big) => BigEndian::write_u16(out, value as u16),
            (ChecksumWidth::U32, WordOrder::Little) => LittleEndian::write_u32(out, value),
            (ChecksumWidth::U32, WordOrder::Big) => BigEndian::write_u32(out, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vectors() -> Vec<u8> {
        let words = [
            0x2000_5000u32,
            0x0800_4101,
            0x0800_4201,
            0x0800_4301,
            0x0800_4401,
            0x0800_4501,
            0x0800_4601,
        ];
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_signature_cancels_sum() {
        let config = ChecksumConfig::default();
        let image = vectors();
        let (bytes, len) = config.signature_bytes(&image);
        assert_eq!(len, 4);
        assert!(config.verify(&image, &bytes[..len]));

        let mut corrupted = image.clone();
        corrupted[5] ^= 0x01;
        assert!(!config.verify(&corrupted, &bytes[..len]));
    }

    #[test]
    fn test_u16_big_endian() {
        let config = ChecksumConfig::new(0x10, 3)
            .with_width(ChecksumWidth::U16)
            .with_byte_order(WordOrder::Big);
        let image = [0x12, 0x34, 0xFF, 0xFF, 0x00, 0x01];
        // 0x1234 + 0xFFFF + 0x0001 = 0x1234 (mod 2^16)
        assert_eq!(config.vector_sum(&image), 0x1234);
        let (bytes, len) = config.signature_bytes(&image);
        assert_eq!(&bytes[..len], &[0xED, 0xCC]);
        assert!(config.verify(&image, &bytes[..len]));
    }

    #[test]
    fn test_erased_flash_does_not_verify() {
        let config = ChecksumConfig::default();
        let erased = vec![0xFF; 64];
        assert!(!config.verify(&erased, &[0xFF; 4]));
    }

    #[test]
    fn test_validate_offset_inside_first_block() {
        assert!(ChecksumConfig::default().validate(512).is_ok());
        assert!(ChecksumConfig::new(0x200, 7).validate(512).is_err());
        assert!(ChecksumConfig::new(0x1FE, 7).validate(512).is_err());
        assert!(ChecksumConfig::new(0x1D9, 7).validate(512).is_err());
        assert!(ChecksumConfig::new(0x10, 7).validate(512).is_err());
        assert!(ChecksumConfig::new(0x100, 0).validate(512).is_err());
    }
}
