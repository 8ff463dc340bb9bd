//! Lazy Pages
//!
//! A page allocated but never touched carries only its target kind and
//! the recipe for its first contents. The claim path calls
//! [`first_touch`] once a frame is installed; the returned payload
//! replaces the uninitialized one in place.

use super::anon::AnonPage;
use super::file::FilePage;
use super::frame::FrameBuf;
use super::page::{PageKind, PageType};
use super::{VmError, VmResult};

/// First-contents recipe consumed at first touch. Cloneable so a pending
/// page can be duplicated into a forked address space.
#[derive(Clone)]
pub enum PageInit {
    /// Leave the zero-filled frame as is (heap/stack pages).
    Zeroed,
    /// Read a file segment into the frame and zero the tail. For a
    /// FILE-target page this record also becomes the final payload.
    File(FilePage),
}

/// Payload of a page that has not been touched yet.
pub struct UninitPage {
    target: PageType,
    init: PageInit,
}

impl UninitPage {
    pub(crate) fn new(target: PageType, init: PageInit) -> Self {
        Self { target, init }
    }

    pub(crate) fn target(&self) -> PageType {
        self.target
    }

    pub(crate) fn init(&self) -> &PageInit {
        &self.init
    }

    /// Duplicate the pending state for an address-space copy.
    pub(crate) fn duplicate(&self) -> (PageType, PageInit) {
        (self.target, self.init.clone())
    }
}

/// Run the initializer against the installed frame and produce the final
/// payload. The frame arrives zero-filled from the pool.
pub(crate) fn first_touch(uninit: &UninitPage, kva: &FrameBuf) -> VmResult<PageKind> {
    let base = uninit.target.base();
    if base == PageType::ANON {
        if let PageInit::File(seg) = &uninit.init {
            // segment-loaded anonymous page (program image)
            seg.load(kva)?;
        }
        Ok(PageKind::Anon(AnonPage::empty()))
    } else if base == PageType::FILE {
        match &uninit.init {
            PageInit::File(seg) => {
                seg.load(kva)?;
                Ok(PageKind::File(seg.clone()))
            }
            PageInit::Zeroed => Err(VmError::InvalidAccess),
        }
    } else {
        Err(VmError::InvalidAccess)
    }
}
