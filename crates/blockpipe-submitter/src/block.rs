//! Core block addressing types for the submission layer.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors per 4KB block, the default block geometry.
pub const DEFAULT_SECTORS_PER_BLOCK: u64 = 4096 / SECTOR_SIZE;

/// Physical block number on the backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pbn(pub u64);

impl Pbn {
    /// Returns the first device sector of this block.
    pub fn start_sector(self, sectors_per_block: u64) -> Sector {
        Sector(self.0.saturating_mul(sectors_per_block))
    }
}

impl fmt::Display for Pbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PBN({})", self.0)
    }
}

/// Device-level sector number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

impl Sector {
    /// The sector `count` sectors before this one, if any.
    #[inline]
    pub fn checked_back(self, count: u64) -> Option<Sector> {
        self.0.checked_sub(count).map(Sector)
    }

    /// The sector `count` sectors after this one, if representable.
    #[inline]
    pub fn checked_front(self, count: u64) -> Option<Sector> {
        self.0.checked_add(count).map(Sector)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sector {}", self.0)
    }
}

/// Identity of the target block device attached to submitted bios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u16);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Data direction of a bio. Only bios of equal direction merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDirection {
    /// Device to memory
    Read,
    /// Memory to device
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}
