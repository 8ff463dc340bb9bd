//! Software Page Map
//!
//! The address-translation layer of one address space, modeled in software:
//! a map from page-aligned virtual addresses to frame handles with the
//! usual entry bits (present, writable, accessed, dirty). The VM core
//! reads and writes these bits exactly where a hardware walker would.

use alloc::collections::BTreeMap;

use super::frame::FrameBuf;
use super::{page_round_down, USER_LIMIT};

bitflags::bitflags! {
    /// Page-map entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

/// True if `va` lies in the user half of the address space.
pub const fn is_user_address(va: u64) -> bool {
    va < USER_LIMIT
}

/// True if `va` lies in the kernel half.
pub const fn is_kernel_address(va: u64) -> bool {
    !is_user_address(va)
}

/// Why a simulated access could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateError {
    /// No present mapping covers the page.
    NotPresent,
    /// Write through a read-only mapping.
    Protection,
}

struct PageMapEntry {
    kva: FrameBuf,
    flags: PageFlags,
}

/// One address space's translations.
pub struct PageMap {
    entries: BTreeMap<u64, PageMapEntry>,
}

impl PageMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install `va -> kva` with the given writability. Fails if a mapping
    /// is already present.
    pub fn set_page(&mut self, va: u64, kva: FrameBuf, writable: bool) -> bool {
        let va = page_round_down(va);
        if self.entries.contains_key(&va) {
            return false;
        }
        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if writable {
            flags |= PageFlags::WRITABLE;
        }
        self.entries.insert(va, PageMapEntry { kva, flags });
        true
    }

    /// Remove the mapping for `va`, if any.
    pub fn clear_page(&mut self, va: u64) {
        self.entries.remove(&page_round_down(va));
    }

    /// Frame handle mapped at `va`, if present.
    pub fn get_page(&self, va: u64) -> Option<FrameBuf> {
        self.entries
            .get(&page_round_down(va))
            .map(|e| e.kva.clone())
    }

    pub fn is_mapped(&self, va: u64) -> bool {
        self.entries.contains_key(&page_round_down(va))
    }

    pub fn is_writable(&self, va: u64) -> bool {
        self.flag(va, PageFlags::WRITABLE)
    }

    pub fn is_accessed(&self, va: u64) -> bool {
        self.flag(va, PageFlags::ACCESSED)
    }

    pub fn set_accessed(&mut self, va: u64, on: bool) {
        self.set_flag(va, PageFlags::ACCESSED, on);
    }

    pub fn is_dirty(&self, va: u64) -> bool {
        self.flag(va, PageFlags::DIRTY)
    }

    pub fn set_dirty(&mut self, va: u64, on: bool) {
        self.set_flag(va, PageFlags::DIRTY, on);
    }

    /// Translate one access the way the walker would: set the accessed bit,
    /// set the dirty bit on writes, refuse writes through read-only
    /// mappings. The returned handle covers the whole page containing `va`;
    /// the caller indexes it with [`page_offset`].
    pub fn translate(&mut self, va: u64, write: bool) -> Result<FrameBuf, TranslateError> {
        let key = page_round_down(va);
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(TranslateError::NotPresent)?;
        if write && !entry.flags.contains(PageFlags::WRITABLE) {
            return Err(TranslateError::Protection);
        }
        entry.flags |= PageFlags::ACCESSED;
        if write {
            entry.flags |= PageFlags::DIRTY;
        }
        Ok(entry.kva.clone())
    }

    fn flag(&self, va: u64, flag: PageFlags) -> bool {
        self.entries
            .get(&page_round_down(va))
            .map(|e| e.flags.contains(flag))
            .unwrap_or(false)
    }

    fn set_flag(&mut self, va: u64, flag: PageFlags, on: bool) {
        if let Some(e) = self.entries.get_mut(&page_round_down(va)) {
            if on {
                e.flags |= flag;
            } else {
                e.flags -= flag;
            }
        }
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::new_frame_buf;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn test_map_unmap() {
        let mut map = PageMap::new();
        let buf = new_frame_buf();
        assert!(map.set_page(0x4000, buf.clone(), true));
        assert!(map.is_mapped(0x4000));
        assert!(map.is_mapped(0x4fff));
        // double map refused
        assert!(!map.set_page(0x4123, buf, false));
        map.clear_page(0x4000);
        assert!(!map.is_mapped(0x4000));
    }

    #[test]
    fn test_accessed_and_dirty_bits() {
        let mut map = PageMap::new();
        map.set_page(0x4000, new_frame_buf(), true);
        assert!(!map.is_accessed(0x4000));
        map.translate(0x4010, false).unwrap();
        assert!(map.is_accessed(0x4000));
        assert!(!map.is_dirty(0x4000));
        map.translate(0x4010, true).unwrap();
        assert!(map.is_dirty(0x4000));
        map.set_accessed(0x4000, false);
        assert!(!map.is_accessed(0x4000));
    }

    #[test]
    fn test_translate_protection() {
        let mut map = PageMap::new();
        map.set_page(0x4000, new_frame_buf(), false);
        assert_eq!(
            map.translate(0x4000, true).unwrap_err(),
            TranslateError::Protection
        );
        assert!(map.translate(0x4000, false).is_ok());
        assert_eq!(
            map.translate(0x9000, false).unwrap_err(),
            TranslateError::NotPresent
        );
    }

    #[test]
    fn test_translated_buffer_is_the_frame() {
        let mut map = PageMap::new();
        let buf = new_frame_buf();
        buf.lock()[PAGE_SIZE - 1] = 0x7E;
        map.set_page(0x4000, buf, true);
        let got = map.translate(0x4fff, false).unwrap();
        assert_eq!(got.lock()[PAGE_SIZE - 1], 0x7E);
    }
}
