//! Page Objects
//!
//! The central entity of the VM core: a common header (virtual address,
//! writability, frame link) over a tagged payload that selects the backing
//! store. Dispatch is a match on the tag. A page starts uninitialized and
//! is rewritten in place into its final kind on first touch; it never
//! changes kind again.

use alloc::sync::Arc;
use spin::Mutex;

use super::anon::AnonPage;
use super::file::FilePage;
use super::frame::{FrameBuf, FrameId, FramePool};
use super::paging::PageMap;
use super::swap::SwapArea;
use super::uninit::{self, PageInit, UninitPage};
use super::{VmError, VmResult};

bitflags::bitflags! {
    /// Declared page kind plus markers. Exactly one of `ANON`/`FILE` is
    /// set; `STACK` marks anonymous pages backing the user stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageType: u32 {
        const ANON  = 1 << 0;
        const FILE  = 1 << 1;
        const STACK = 1 << 3;
    }
}

impl PageType {
    /// The kind bits without markers.
    pub fn base(self) -> PageType {
        self & (PageType::ANON | PageType::FILE)
    }
}

/// Link from a resident page to the frame holding its contents.
#[derive(Clone)]
pub struct FrameLink {
    pub(crate) id: FrameId,
    pub(crate) kva: FrameBuf,
}

/// Kind-specific payload.
pub(crate) enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// A page of a user address space. Owned by its supplemental page table;
/// shared behind a lock so the evictor can reach it through the frame's
/// back-reference.
pub struct Page {
    va: u64,
    writable: bool,
    frame: Option<FrameLink>,
    kind: PageKind,
}

pub type PageRef = Arc<Mutex<Page>>;

impl Page {
    pub(crate) fn new_uninit(target: PageType, va: u64, writable: bool, init: PageInit) -> Self {
        Self {
            va,
            writable,
            frame: None,
            kind: PageKind::Uninit(UninitPage::new(target, init)),
        }
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The declared kind: an uninitialized page reports what it will
    /// become, not what it is.
    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(u) => u.target(),
            PageKind::Anon(_) => PageType::ANON,
            PageKind::File(_) => PageType::FILE,
        }
    }

    /// Bytes covered by the whole mapping this page belongs to, recorded
    /// at mmap time. `None` for anonymous pages.
    pub(crate) fn mapped_length(&self) -> Option<usize> {
        match &self.kind {
            PageKind::File(f) => Some(f.length),
            PageKind::Uninit(u) => match u.init() {
                PageInit::File(f) => Some(f.length),
                PageInit::Zeroed => None,
            },
            PageKind::Anon(_) => None,
        }
    }

    pub(crate) fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub(crate) fn frame_link(&self) -> Option<&FrameLink> {
        self.frame.as_ref()
    }

    pub(crate) fn attach_frame(&mut self, link: FrameLink) {
        self.frame = Some(link);
    }

    pub(crate) fn detach_frame(&mut self) -> Option<FrameLink> {
        self.frame.take()
    }

    /// Populate the freshly-installed frame from the backing store. For an
    /// uninitialized page this is the transformation path: the payload is
    /// rewritten into its final kind, then the initializer fills the frame.
    pub(crate) fn swap_in(&mut self, swap: &SwapArea, kva: &FrameBuf) -> VmResult<()> {
        if let PageKind::Uninit(u) = &self.kind {
            let kind = uninit::first_touch(u, kva)?;
            self.kind = kind;
            log::debug!(
                "[VM] lazy page at {:#x} became {:?}",
                self.va,
                self.page_type()
            );
            return Ok(());
        }
        match &mut self.kind {
            PageKind::Anon(a) => a.swap_in(swap, kva),
            PageKind::File(f) => f.swap_in(kva),
            PageKind::Uninit(_) => Err(VmError::InvalidAccess),
        }
    }

    /// Move a resident page's contents out to its backing store and drop
    /// the frame link and translation. The frame itself stays with the
    /// caller (the evictor).
    pub(crate) fn swap_out(
        &mut self,
        swap: &SwapArea,
        map: Option<&Mutex<PageMap>>,
    ) -> VmResult<()> {
        let link = self.frame.clone().ok_or(VmError::NotMapped)?;
        match &mut self.kind {
            // never resident, never a victim
            PageKind::Uninit(_) => return Err(VmError::InvalidAccess),
            PageKind::Anon(a) => a.swap_out(swap, &link.kva)?,
            PageKind::File(f) => {
                let dirty = map.map(|m| m.lock().is_dirty(self.va)).unwrap_or(false);
                if dirty {
                    f.writeback(&link.kva)?;
                }
            }
        }
        self.frame = None;
        if let Some(m) = map {
            m.lock().clear_page(self.va);
        }
        log::debug!("[VM] swapped out page at {:#x}", self.va);
        Ok(())
    }

    /// Release everything the page holds: swap slot, dirty file contents,
    /// frame, translation. The page object itself is freed by the caller.
    pub(crate) fn destroy(&mut self, frames: &FramePool, swap: &SwapArea, map: &Mutex<PageMap>) {
        match &mut self.kind {
            // never touched: nothing to flush or free
            PageKind::Uninit(_) => {}
            PageKind::Anon(a) => {
                if let Some(slot) = a.take_slot() {
                    swap.free_slot(slot);
                }
            }
            PageKind::File(f) => {
                if let Some(link) = &self.frame {
                    if map.lock().is_dirty(self.va) {
                        if f.writeback(&link.kva).is_err() {
                            log::warn!("[VM] writeback failed for page at {:#x}", self.va);
                        }
                    }
                }
            }
        }
        if let Some(link) = self.frame.take() {
            map.lock().clear_page(self.va);
            frames.release(link.id);
        }
    }
}
