//! Block Device Layer
//!
//! Sector-granular storage as seen by the kernel. The swap area drives its
//! backing store through the [`BlockDevice`] trait; [`RamDisk`] is the
//! memory-backed device used for bring-up and self-tests.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Disk sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// A device addressable in `SECTOR_SIZE` units.
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read one sector into `buf`. `buf.len()` must be `SECTOR_SIZE`.
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), &'static str>;

    /// Write one sector from `buf`. `buf.len()` must be `SECTOR_SIZE`.
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), &'static str>;
}

/// RAM-backed block device.
pub struct RamDisk {
    sectors: u64,
    data: Mutex<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a zero-filled RAM disk of `sectors` sectors.
    pub fn new(sectors: u64) -> Self {
        Self {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Sectors read and written so far.
    pub fn io_counts(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.writes.load(Ordering::Relaxed),
        )
    }

    fn range(&self, sector: u64, len: usize) -> Result<(usize, usize), &'static str> {
        if sector >= self.sectors {
            return Err("sector out of range");
        }
        if len != SECTOR_SIZE {
            return Err("buffer is not one sector");
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok((start, start + SECTOR_SIZE))
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), &'static str> {
        let (start, end) = self.range(sector, buf.len())?;
        buf.copy_from_slice(&self.data.lock()[start..end]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), &'static str> {
        let (start, end) = self.range(sector, buf.len())?;
        self.data.lock()[start..end].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
