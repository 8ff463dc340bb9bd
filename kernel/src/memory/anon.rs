//! Anonymous Pages
//!
//! Heap and stack pages with no file behind them. Contents start zeroed;
//! on eviction they move to a freshly allocated swap slot, and swapping
//! back in returns the slot to the pool. A page therefore never pins a
//! slot while resident.

use super::frame::FrameBuf;
use super::swap::SwapArea;
use super::{VmError, VmResult};

/// Payload of an anonymous page: the swap slot holding its contents, or
/// `None` while resident or never swapped.
pub struct AnonPage {
    slot: Option<usize>,
}

impl AnonPage {
    pub(crate) fn empty() -> Self {
        Self { slot: None }
    }

    pub(crate) fn take_slot(&mut self) -> Option<usize> {
        self.slot.take()
    }

    /// Restore contents from the recorded slot and return it to the pool.
    pub(crate) fn swap_in(&mut self, swap: &SwapArea, kva: &FrameBuf) -> VmResult<()> {
        let slot = self.slot.ok_or(VmError::Io)?;
        if !swap.slot_in_use(slot) {
            // slot record and bitmap disagree
            return Err(VmError::Io);
        }
        swap.read_slot(slot, &mut kva.lock())?;
        swap.free_slot(slot);
        self.slot = None;
        log::debug!("[ANON] swapped in from slot {}", slot);
        Ok(())
    }

    /// Write contents to a fresh slot and record it.
    pub(crate) fn swap_out(&mut self, swap: &SwapArea, kva: &FrameBuf) -> VmResult<()> {
        let slot = swap.alloc_slot()?;
        if let Err(e) = swap.write_slot(slot, &kva.lock()) {
            swap.free_slot(slot);
            return Err(e);
        }
        self.slot = Some(slot);
        log::debug!("[ANON] swapped out to slot {}", slot);
        Ok(())
    }
}
