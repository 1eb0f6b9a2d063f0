//! RAM image of one flash write block.

/// Default write-block size in bytes.
pub const DEFAULT_WRITE_BLOCK_SIZE: usize = 512;

/// One write block buffered in RAM.
///
/// `base` is `None` while the block is not open. When open it is a multiple
/// of `N` and `data` mirrors flash contents with pending writes applied.
#[derive(Debug, Clone)]
pub struct FlashBlock<const N: usize = DEFAULT_WRITE_BLOCK_SIZE> {
    base: Option<u32>,
    data: [u8; N],
    decrypted: bool,
}

impl<const N: usize> FlashBlock<N> {
    /// Size of the block in bytes.
    pub const SIZE: usize = N;

    /// A closed block.
    pub const fn new() -> Self {
        Self {
            base: None,
            data: [0xFF; N],
            decrypted: false,
        }
    }

    /// Block-aligned base of `address`.
    #[allow(clippy::cast_possible_truncation)] // N is at most a few KiB
    pub const fn align(address: u32) -> u32 {
        address - (address % N as u32)
    }

    /// Base address of the open block.
    pub fn base(&self) -> Option<u32> {
        self.base
    }

    /// Whether the block is open at `base`.
    pub fn is_open_at(&self, base: u32) -> bool {
        self.base == Some(base)
    }

    /// Whether the block is open.
    pub fn is_open(&self) -> bool {
        self.base.is_some()
    }

    /// Mark the block open at `base` and hand out its buffer, which the
    /// caller fills with the current flash contents.
    pub(crate) fn open(&mut self, base: u32) -> &mut [u8; N] {
        self.base = Some(base);
        self.decrypted = false;
        &mut self.data
    }

    /// Close the block without programming it.
    pub fn invalidate(&mut self) {
        self.base = None;
        self.decrypted = false;
    }

    /// Copy `src` into the image at `offset`.
    ///
    /// Returns the number of bytes copied, which stops at the end of the
    /// block.
    pub(crate) fn fill(&mut self, offset: usize, src: &[u8]) -> usize {
        let room = N.saturating_sub(offset);
        let n = room.min(src.len());
        self.data[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }

    /// Current RAM image.
    pub fn data(&self) -> &[u8; N] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8; N] {
        &mut self.data
    }

    pub(crate) fn is_decrypted(&self) -> bool {
        self.decrypted
    }

    pub(crate) fn mark_decrypted(&mut self) {
        self.decrypted = true;
    }
}

impl<const N: usize> Default for FlashBlock<N> {
    fn default() -> Self {
        Self::new()
    }
}
