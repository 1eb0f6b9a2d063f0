//! Non-volatile memory handling.
//!
//! - [`layout`]: sector table of the programmable flash region
//! - [`block`]: RAM image of one write block
//! - [`checksum`]: vector-table signature checksum
//! - [`manager`]: the block manager driving an update session
//! - [`sim`]: simulated NOR flash for hosts and tests

pub mod block;
pub mod checksum;
pub mod layout;
pub mod manager;
pub mod sim;

pub use block::{DEFAULT_WRITE_BLOCK_SIZE, FlashBlock};
pub use checksum::{ChecksumConfig, ChecksumWidth, WordOrder};
pub use layout::{SectorDescriptor, SectorTable};
pub use manager::BlockManager;
pub use sim::SimFlash;
