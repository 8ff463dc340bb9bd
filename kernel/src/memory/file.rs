//! File-Backed Pages
//!
//! Memory-mapped files. Each page of a mapping records the file slice it
//! mirrors; the file itself is authoritative for clean pages, so eviction
//! writes back only when the hardware dirty bit says the frame diverged.
//! `do_mmap`/`do_munmap` build and tear down whole mappings.

use crate::ramfs::File;

use super::frame::FrameBuf;
use super::page::PageType;
use super::paging::is_user_address;
use super::uninit::PageInit;
use super::vm::{AddressSpace, Vm};
use super::{page_round_down, VmError, VmResult, PAGE_MASK, PAGE_SIZE};

/// Payload of a file-backed page, also used as the initializer record for
/// a pending one: read `read_bytes` of `file` at `offset`, zero the next
/// `zero_bytes`. `length` is the byte length of the whole mapping and is
/// recorded in every page so unmap can size the teardown from any start
/// page.
#[derive(Clone)]
pub struct FilePage {
    pub file: File,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub length: usize,
}

impl FilePage {
    /// Fill a frame from the file slice: read then zero the tail.
    pub(crate) fn load(&self, kva: &FrameBuf) -> VmResult<()> {
        let mut buf = kva.lock();
        let n = self.file.read_at(&mut buf[..self.read_bytes], self.offset);
        if n != self.read_bytes {
            log::warn!(
                "[FILE] short read at offset {:#x}: {} of {}",
                self.offset,
                n,
                self.read_bytes
            );
            return Err(VmError::Io);
        }
        buf[self.read_bytes..self.read_bytes + self.zero_bytes].fill(0);
        Ok(())
    }

    /// Reclaim after eviction: the file still has the bytes.
    pub(crate) fn swap_in(&self, kva: &FrameBuf) -> VmResult<()> {
        self.load(kva)
    }

    /// Flush the frame's file slice back to the file.
    pub(crate) fn writeback(&self, kva: &FrameBuf) -> VmResult<()> {
        let buf = kva.lock();
        let n = self.file.write_at(&buf[..self.read_bytes], self.offset);
        if n != self.read_bytes {
            return Err(VmError::Io);
        }
        log::debug!(
            "[FILE] wrote back {} bytes at offset {:#x}",
            n,
            self.offset
        );
        Ok(())
    }
}

/// Map `length` bytes of `file` starting at `offset` to `addr`. The
/// mapping holds a private reopened handle; pages are created lazily and
/// faulted in on first touch. Returns the mapping address.
///
/// Pages inserted before a mid-map failure are not rolled back; the
/// failing page itself never lands in the table.
pub fn do_mmap(
    vm: &Vm,
    aspace: &AddressSpace,
    addr: u64,
    length: usize,
    writable: bool,
    file: &File,
    offset: u64,
) -> VmResult<u64> {
    if addr == 0 || addr & PAGE_MASK != 0 || offset & PAGE_MASK != 0 {
        return Err(VmError::InvalidAccess);
    }
    let length = length.min(file.length());
    if length == 0 {
        return Err(VmError::InvalidAccess);
    }
    let end = addr
        .checked_add(super::page_round_up(length as u64))
        .ok_or(VmError::InvalidAccess)?;
    if !is_user_address(end - 1) {
        return Err(VmError::InvalidAccess);
    }

    // Private handle: closing the caller's descriptor must not tear the
    // mapping down.
    let file = file.reopen();

    let mut va = addr;
    let mut offset = offset;
    let mut remaining = length;
    while remaining > 0 {
        let read_bytes = remaining.min(PAGE_SIZE);
        let seg = FilePage {
            file: file.clone(),
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
            length,
        };
        vm.alloc_page_with_initializer(aspace, PageType::FILE, va, writable, PageInit::File(seg))?;
        va += PAGE_SIZE as u64;
        offset += read_bytes as u64;
        remaining -= read_bytes;
    }
    log::debug!(
        "[FILE] mapped {} bytes at {:#x} (writable: {})",
        length,
        addr,
        writable
    );
    Ok(addr)
}

/// Tear down the mapping starting at `addr`, flushing dirty resident pages
/// back to the file. Pages missing from a partially built mapping are
/// skipped.
pub fn do_munmap(vm: &Vm, aspace: &AddressSpace, addr: u64) -> VmResult<()> {
    let addr = page_round_down(addr);
    let first = aspace.find_page(addr).ok_or(VmError::NotMapped)?;
    let length = first
        .lock()
        .mapped_length()
        .ok_or(VmError::InvalidAccess)?;
    let pages = (length + PAGE_SIZE - 1) / PAGE_SIZE;

    for i in 0..pages {
        let va = addr + (i * PAGE_SIZE) as u64;
        match vm.dealloc_page(aspace, va) {
            Ok(()) | Err(VmError::NotMapped) => {}
            Err(e) => return Err(e),
        }
    }
    log::debug!("[FILE] unmapped {} pages at {:#x}", pages, addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;
    use crate::memory::VmConfig;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn setup(frames: usize) -> (Vm, Arc<AddressSpace>) {
        let vm = Vm::new(
            VmConfig {
                user_frames: frames,
                ..VmConfig::default()
            },
            Box::new(RamDisk::new(64 * 8)),
        );
        (vm, Arc::new(AddressSpace::new()))
    }

    fn patterned_file(len: usize) -> File {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        File::from_bytes(&bytes)
    }

    const MAP: u64 = 0x1000_0000;

    #[test]
    fn test_mmap_requires_alignment() {
        let (vm, aspace) = setup(4);
        let f = patterned_file(100);
        assert_eq!(
            do_mmap(&vm, &aspace, MAP + 1, 100, true, &f, 0),
            Err(VmError::InvalidAccess)
        );
        assert_eq!(
            do_mmap(&vm, &aspace, MAP, 100, true, &f, 5),
            Err(VmError::InvalidAccess)
        );
        assert_eq!(
            do_mmap(&vm, &aspace, 0, 100, true, &f, 0),
            Err(VmError::InvalidAccess)
        );
    }

    #[test]
    fn test_mmap_clips_to_file_length() {
        let (vm, aspace) = setup(4);
        let f = patterned_file(PAGE_SIZE + 10);
        do_mmap(&vm, &aspace, MAP, 10 * PAGE_SIZE, true, &f, 0).unwrap();
        // two pages cover the clipped length
        assert!(aspace.find_page(MAP).is_some());
        assert!(aspace.find_page(MAP + PAGE_SIZE as u64).is_some());
        assert!(aspace.find_page(MAP + 2 * PAGE_SIZE as u64).is_none());
    }

    #[test]
    fn test_mmap_rejects_empty_file() {
        let (vm, aspace) = setup(4);
        let f = File::from_bytes(b"");
        assert_eq!(
            do_mmap(&vm, &aspace, MAP, PAGE_SIZE, true, &f, 0),
            Err(VmError::InvalidAccess)
        );
    }

    #[test]
    fn test_double_map_rejected() {
        let (vm, aspace) = setup(4);
        vm.alloc_page(&aspace, PageType::ANON, MAP, true).unwrap();
        let f = patterned_file(PAGE_SIZE);
        assert_eq!(
            do_mmap(&vm, &aspace, MAP, PAGE_SIZE, true, &f, 0),
            Err(VmError::Duplicate)
        );
        // the pre-existing page is untouched
        let page = aspace.find_page(MAP).unwrap();
        assert_eq!(page.lock().page_type(), PageType::ANON);
    }

    #[test]
    fn test_partial_map_not_rolled_back() {
        let (vm, aspace) = setup(4);
        // occupy the second page of the would-be mapping
        vm.alloc_page(&aspace, PageType::ANON, MAP + PAGE_SIZE as u64, true)
            .unwrap();
        let f = patterned_file(2 * PAGE_SIZE);
        assert_eq!(
            do_mmap(&vm, &aspace, MAP, 2 * PAGE_SIZE, true, &f, 0),
            Err(VmError::Duplicate)
        );
        // pages inserted before the failure are not rolled back
        let first = aspace.find_page(MAP).unwrap();
        assert_eq!(first.lock().page_type(), PageType::FILE);
    }

    #[test]
    fn test_munmap_of_untouched_mapping_is_noop_on_file() {
        let (vm, aspace) = setup(4);
        let f = patterned_file(PAGE_SIZE);
        let before: Vec<u8> = {
            let mut buf = alloc::vec![0u8; PAGE_SIZE];
            f.read_at(&mut buf, 0);
            buf
        };
        do_mmap(&vm, &aspace, MAP, PAGE_SIZE, true, &f, 0).unwrap();
        do_munmap(&vm, &aspace, MAP).unwrap();
        let after: Vec<u8> = {
            let mut buf = alloc::vec![0u8; PAGE_SIZE];
            f.read_at(&mut buf, 0);
            buf
        };
        assert_eq!(before, after);
        assert!(aspace.find_page(MAP).is_none());
    }

    #[test]
    fn test_munmap_on_anon_page_rejected() {
        let (vm, aspace) = setup(4);
        vm.alloc_page(&aspace, PageType::ANON, MAP, true).unwrap();
        assert_eq!(
            do_munmap(&vm, &aspace, MAP),
            Err(VmError::InvalidAccess)
        );
    }
}
