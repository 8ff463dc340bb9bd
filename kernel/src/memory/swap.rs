//! Swap Area
//!
//! Partitions a block device into page-sized slots of 8 contiguous
//! sectors. A word bitmap tracks slot occupancy; allocation is a
//! scan-and-flip of the first clear bit under the bitmap lock. Slot I/O
//! runs outside that lock.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::disk::{BlockDevice, SECTOR_SIZE};

use super::{VmError, VmResult, PAGE_SIZE};

/// Sectors per swap slot: one page.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

struct SlotBitmap {
    words: Vec<u64>,
    slots: usize,
    used: usize,
}

/// The swap device and its slot allocator.
pub struct SwapArea {
    disk: Box<dyn BlockDevice>,
    bitmap: Mutex<SlotBitmap>,
    swapped_in: AtomicU64,
    swapped_out: AtomicU64,
}

impl SwapArea {
    /// Carve `disk` into slots. Trailing sectors that do not fill a slot
    /// are unused.
    pub fn new(disk: Box<dyn BlockDevice>) -> Self {
        let slots = (disk.sector_count() / SECTORS_PER_SLOT as u64) as usize;
        log::info!("[SWAP] {} slots ({} KB)", slots, slots * PAGE_SIZE / 1024);
        Self {
            disk,
            bitmap: Mutex::new(SlotBitmap {
                words: vec![0u64; (slots + 63) / 64],
                slots,
                used: 0,
            }),
            swapped_in: AtomicU64::new(0),
            swapped_out: AtomicU64::new(0),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().slots
    }

    pub fn used_slots(&self) -> usize {
        self.bitmap.lock().used
    }

    /// (pages swapped in, pages swapped out) so far.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.swapped_in.load(Ordering::Relaxed),
            self.swapped_out.load(Ordering::Relaxed),
        )
    }

    /// Claim the first free slot.
    pub(crate) fn alloc_slot(&self) -> VmResult<usize> {
        let mut guard = self.bitmap.lock();
        let bm = &mut *guard;
        for (wi, word) in bm.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = wi * 64 + bit;
            if slot >= bm.slots {
                break;
            }
            *word |= 1u64 << bit;
            bm.used += 1;
            return Ok(slot);
        }
        Err(VmError::SwapFull)
    }

    /// Return `slot` to the pool.
    pub(crate) fn free_slot(&self, slot: usize) {
        let mut bm = self.bitmap.lock();
        if slot >= bm.slots {
            return;
        }
        let (wi, bit) = (slot / 64, slot % 64);
        if bm.words[wi] & (1u64 << bit) != 0 {
            bm.words[wi] &= !(1u64 << bit);
            bm.used -= 1;
        }
    }

    /// Whether `slot` is currently allocated.
    pub(crate) fn slot_in_use(&self, slot: usize) -> bool {
        let bm = self.bitmap.lock();
        slot < bm.slots && bm.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// Read one slot into a page buffer.
    pub(crate) fn read_slot(&self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> VmResult<()> {
        let base = (slot * SECTORS_PER_SLOT) as u64;
        for i in 0..SECTORS_PER_SLOT {
            let chunk = &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            self.disk.read_sector(base + i as u64, chunk).map_err(|e| {
                log::warn!("[SWAP] read of slot {} failed: {}", slot, e);
                VmError::Io
            })?;
        }
        self.swapped_in.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write a page buffer into one slot.
    pub(crate) fn write_slot(&self, slot: usize, buf: &[u8; PAGE_SIZE]) -> VmResult<()> {
        let base = (slot * SECTORS_PER_SLOT) as u64;
        for i in 0..SECTORS_PER_SLOT {
            let chunk = &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            self.disk.write_sector(base + i as u64, chunk).map_err(|e| {
                log::warn!("[SWAP] write of slot {} failed: {}", slot, e);
                VmError::Io
            })?;
        }
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;

    fn area(slots: u64) -> SwapArea {
        SwapArea::new(Box::new(RamDisk::new(slots * SECTORS_PER_SLOT as u64)))
    }

    #[test]
    fn test_scan_and_flip() {
        let swap = area(3);
        assert_eq!(swap.slot_count(), 3);
        assert_eq!(swap.alloc_slot().unwrap(), 0);
        assert_eq!(swap.alloc_slot().unwrap(), 1);
        assert!(swap.slot_in_use(0));
        swap.free_slot(0);
        assert!(!swap.slot_in_use(0));
        // first clear bit wins
        assert_eq!(swap.alloc_slot().unwrap(), 0);
        assert_eq!(swap.used_slots(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let swap = area(2);
        swap.alloc_slot().unwrap();
        swap.alloc_slot().unwrap();
        assert_eq!(swap.alloc_slot(), Err(VmError::SwapFull));
        swap.free_slot(1);
        assert_eq!(swap.alloc_slot().unwrap(), 1);
    }

    #[test]
    fn test_slot_io_roundtrip() {
        let swap = area(2);
        let slot = swap.alloc_slot().unwrap();
        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        swap.write_slot(slot, &page).unwrap();
        let mut back = [0u8; PAGE_SIZE];
        swap.read_slot(slot, &mut back).unwrap();
        assert_eq!(page[..], back[..]);
        assert_eq!(swap.traffic(), (1, 1));
    }

    #[test]
    fn test_double_free_is_harmless() {
        let swap = area(2);
        let slot = swap.alloc_slot().unwrap();
        swap.free_slot(slot);
        swap.free_slot(slot);
        assert_eq!(swap.used_slots(), 0);
    }
}
