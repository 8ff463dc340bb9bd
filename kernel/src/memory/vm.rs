//! VM Core
//!
//! Ties the pieces together: the subsystem value ([`Vm`]) owning the frame
//! pool and swap area, per-process address spaces (supplemental page table
//! + page map), the claim path, and eviction. Everything the original
//! design kept in globals lives in `Vm` and is threaded through calls.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::disk::BlockDevice;

use super::frame::{FrameBuf, FrameId, FrameOwner, FramePool};
use super::page::{FrameLink, Page, PageKind, PageRef, PageType};
use super::paging::{is_user_address, PageMap};
use super::spt::SupplementalPageTable;
use super::swap::SwapArea;
use super::uninit::PageInit;
use super::{page_round_down, VmConfig, VmError, VmResult, VmStats, PAGE_MASK, PAGE_SIZE};

/// One process's view of memory: its page index and its translations.
pub struct AddressSpace {
    pub(crate) spt: Mutex<SupplementalPageTable>,
    map: Arc<Mutex<PageMap>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            spt: Mutex::new(SupplementalPageTable::new()),
            map: Arc::new(Mutex::new(PageMap::new())),
        }
    }

    /// The translation layer, shared with frames that back this space.
    pub fn page_map(&self) -> &Arc<Mutex<PageMap>> {
        &self.map
    }

    /// Look up the page covering `va`.
    pub fn find_page(&self, va: u64) -> Option<PageRef> {
        self.spt.lock().find(va)
    }

    /// Number of pages in the supplemental page table.
    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// The virtual memory subsystem.
pub struct Vm {
    frames: FramePool,
    swap: SwapArea,
    config: VmConfig,
    faults_handled: AtomicU64,
    faults_rejected: AtomicU64,
}

impl Vm {
    /// Bring up the subsystem over `swap_disk`.
    pub fn new(config: VmConfig, swap_disk: Box<dyn BlockDevice>) -> Self {
        let config = config.clamped();
        log::info!(
            "[VM] frame pool: {} frames ({} KB)",
            config.user_frames,
            config.user_frames * PAGE_SIZE / 1024
        );
        Self {
            frames: FramePool::new(config.user_frames),
            swap: SwapArea::new(swap_disk),
            config,
            faults_handled: AtomicU64::new(0),
            faults_rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> VmStats {
        let (swapped_in, swapped_out) = self.swap.traffic();
        VmStats {
            frames_used: self.frames.used(),
            frames_total: self.frames.capacity(),
            slots_used: self.swap.used_slots(),
            slots_total: self.swap.slot_count(),
            swapped_in,
            swapped_out,
            faults_handled: self.faults_handled.load(Ordering::Relaxed),
            faults_rejected: self.faults_rejected.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_fault(&self, handled: bool) {
        if handled {
            self.faults_handled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.faults_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Create a pending page of `target` kind at `va`. The page enters the
    /// supplemental page table immediately; no frame is associated until
    /// the first touch.
    pub fn alloc_page_with_initializer(
        &self,
        aspace: &AddressSpace,
        target: PageType,
        va: u64,
        writable: bool,
        init: PageInit,
    ) -> VmResult<()> {
        if va == 0 || va & PAGE_MASK != 0 || !is_user_address(va) {
            return Err(VmError::InvalidAccess);
        }
        let base = target.base();
        if base != PageType::ANON && base != PageType::FILE {
            return Err(VmError::InvalidAccess);
        }
        aspace
            .spt
            .lock()
            .insert(Page::new_uninit(target, va, writable, init))?;
        Ok(())
    }

    /// Create a pending zero-filled page.
    pub fn alloc_page(
        &self,
        aspace: &AddressSpace,
        target: PageType,
        va: u64,
        writable: bool,
    ) -> VmResult<()> {
        self.alloc_page_with_initializer(aspace, target, va, writable, PageInit::Zeroed)
    }

    /// Fault-in the page covering `va`: frame, translation, contents.
    /// `NotMapped` means no page covers the address (the caller may then
    /// consider stack growth).
    pub fn claim_page(&self, aspace: &AddressSpace, va: u64) -> VmResult<()> {
        let page = aspace
            .spt
            .lock()
            .find(page_round_down(va))
            .ok_or(VmError::NotMapped)?;
        self.do_claim(aspace.page_map(), &page)
    }

    /// Remove the page at `va` from the table and release its resources.
    pub fn dealloc_page(&self, aspace: &AddressSpace, va: u64) -> VmResult<()> {
        let page = aspace
            .spt
            .lock()
            .remove(va)
            .ok_or(VmError::NotMapped)?;
        page.lock().destroy(&self.frames, &self.swap, &aspace.map);
        Ok(())
    }

    /// Tear down every page of an address space, flushing dirty mapped
    /// files. Safe to call more than once.
    pub fn kill_address_space(&self, aspace: &AddressSpace) {
        let entries = aspace.spt.lock().drain();
        let count = entries.len();
        for (_va, page) in entries {
            page.lock().destroy(&self.frames, &self.swap, &aspace.map);
        }
        if count > 0 {
            log::debug!("[VM] tore down address space ({} pages)", count);
        }
    }

    /// Duplicate `src` into `dst` with eager contents: pending pages stay
    /// pending with the same recipe; live pages are recreated, claimed and
    /// copied byte for byte, so later writes on either side are private.
    pub fn copy_address_space(&self, dst: &AddressSpace, src: &AddressSpace) -> VmResult<()> {
        let entries = src.spt.lock().entries();
        for (va, src_page) in entries {
            // still pending: duplicate the recipe, stay lazy
            let pending = {
                let p = src_page.lock();
                match p.kind() {
                    PageKind::Uninit(u) => Some((u.duplicate(), p.writable())),
                    _ => None,
                }
            };
            if let Some(((target, init), writable)) = pending {
                self.alloc_page_with_initializer(dst, target, va, writable, init)?;
                continue;
            }

            // live: make sure it is resident, then snapshot
            let mut content = Box::new([0u8; PAGE_SIZE]);
            let (target, seed, writable) = loop {
                {
                    let p = src_page.lock();
                    if let Some(link) = p.frame_link() {
                        content.copy_from_slice(&link.kva.lock()[..]);
                        let (target, seed) = match p.kind() {
                            PageKind::Anon(_) => (PageType::ANON, PageInit::Zeroed),
                            PageKind::File(f) => (PageType::FILE, PageInit::File(f.clone())),
                            // a page never reverts to pending
                            PageKind::Uninit(_) => return Err(VmError::InvalidAccess),
                        };
                        break (target, seed, p.writable());
                    }
                }
                self.do_claim(src.page_map(), &src_page)?;
            };

            self.alloc_page_with_initializer(dst, target, va, writable, seed)?;
            let dst_page = dst
                .spt
                .lock()
                .find(va)
                .ok_or(VmError::NotMapped)?;
            self.do_claim(dst.page_map(), &dst_page)?;
            let p = dst_page.lock();
            if let Some(link) = p.frame_link() {
                link.kva.lock().copy_from_slice(&content[..]);
            }
        }
        Ok(())
    }

    /// The claim path: frame, back-links, translation, then the page's own
    /// swap-in (which for a pending page runs the initializer).
    pub(crate) fn do_claim(&self, map: &Arc<Mutex<PageMap>>, page: &PageRef) -> VmResult<()> {
        let mut p = page.lock();
        if p.is_resident() {
            return Ok(());
        }
        let (id, kva) = self.get_frame()?;
        p.attach_frame(FrameLink {
            id,
            kva: kva.clone(),
        });
        self.frames.set_owner(
            id,
            FrameOwner {
                page: Arc::downgrade(page),
                map: Arc::downgrade(map),
                va: p.va(),
            },
        );
        if !map.lock().set_page(p.va(), kva.clone(), p.writable()) {
            p.detach_frame();
            self.frames.clear_owner(id);
            return Err(VmError::Duplicate);
        }
        if let Err(e) = p.swap_in(&self.swap, &kva) {
            // unwind the half-claimed state so the fault fails cleanly
            map.lock().clear_page(p.va());
            p.detach_frame();
            self.frames.clear_owner(id);
            return Err(e);
        }
        Ok(())
    }

    /// A usable, zero-filled frame; evicts when the pool is exhausted.
    fn get_frame(&self) -> VmResult<(FrameId, FrameBuf)> {
        if let Some((id, kva)) = self.frames.try_alloc() {
            return Ok((id, kva));
        }
        let (id, kva) = self.evict_frame()?;
        FramePool::scrub(&kva);
        Ok((id, kva))
    }

    /// Second chance over the circular frame list. Pass one skips frames
    /// whose accessed bit is set, clearing it; pass two takes the first
    /// frame whose swap-out succeeds.
    fn evict_frame(&self) -> VmResult<(FrameId, FrameBuf)> {
        let candidates = self.frames.used();
        if candidates == 0 {
            return Err(VmError::NoMemory);
        }
        for pass in 0..2 {
            for _ in 0..candidates {
                let Some((id, kva, owner)) = self.frames.cursor_next() else {
                    break;
                };
                let owner = match owner {
                    Some(o) => o,
                    None => {
                        // unowned frame: reclaim directly
                        return Ok((id, kva));
                    }
                };
                if pass == 0 {
                    if let Some(map) = owner.map.upgrade() {
                        let mut m = map.lock();
                        if m.is_accessed(owner.va) {
                            m.set_accessed(owner.va, false);
                            continue;
                        }
                    }
                }
                if self.swap_out_victim(id, &owner).is_ok() {
                    self.frames.clear_owner(id);
                    log::debug!("[VM] evicted frame {} (page {:#x})", id, owner.va);
                    return Ok((id, kva));
                }
            }
        }
        log::warn!("[VM] eviction failed: no victim could be swapped out");
        Err(VmError::NoMemory)
    }

    /// Push one victim's contents out through its own swap-out. Stale
    /// ownership (the page moved on or died) leaves the frame reclaimable.
    fn swap_out_victim(&self, id: FrameId, owner: &FrameOwner) -> VmResult<()> {
        let page = match owner.page.upgrade() {
            Some(p) => p,
            None => return Ok(()),
        };
        let map = owner.map.upgrade();
        let mut p = page.lock();
        match p.frame_link() {
            Some(link) if link.id == id => {}
            _ => return Ok(()),
        }
        p.swap_out(&self.swap, map.as_deref())
    }
}
