//! Supplemental Page Table
//!
//! Per-process index from page-aligned virtual addresses to page objects.
//! The table owns its pages; entries are shared behind a lock so the
//! evictor can reach a victim page through the frame's back-reference
//! without going through the table.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::page::{Page, PageRef};
use super::{page_round_down, VmError, VmResult};

pub struct SupplementalPageTable {
    pages: BTreeMap<u64, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    /// Look up the page covering `va`. Sub-page offsets are rounded away.
    pub fn find(&self, va: u64) -> Option<PageRef> {
        self.pages.get(&page_round_down(va)).cloned()
    }

    /// Insert a page at its virtual address. Fails if the address is
    /// already occupied.
    pub(crate) fn insert(&mut self, page: Page) -> VmResult<PageRef> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::Duplicate);
        }
        let page = Arc::new(Mutex::new(page));
        self.pages.insert(va, page.clone());
        Ok(page)
    }

    /// Remove and return the page at `va`.
    pub(crate) fn remove(&mut self, va: u64) -> Option<PageRef> {
        self.pages.remove(&page_round_down(va))
    }

    /// Snapshot of all entries, in address order.
    pub(crate) fn entries(&self) -> Vec<(u64, PageRef)> {
        self.pages.iter().map(|(va, p)| (*va, p.clone())).collect()
    }

    /// Empty the table, handing every entry to the caller for teardown.
    pub(crate) fn drain(&mut self) -> Vec<(u64, PageRef)> {
        let out: Vec<(u64, PageRef)> = self.pages.iter().map(|(va, p)| (*va, p.clone())).collect();
        self.pages.clear();
        out
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}
