//! Frame Pool
//!
//! Fixed-capacity pool of physical user frames. Live frames sit on a
//! circular victim list walked by the second-chance cursor; the pool lock
//! is held only across list and ownership mutations, never across swap or
//! file I/O. Every frame handed out is zero-filled.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use super::page::Page;
use super::paging::PageMap;
use super::PAGE_SIZE;

/// Index of a frame in the pool arena.
pub type FrameId = usize;

/// Kernel-visible handle to a frame's storage, shared with the page map.
pub type FrameBuf = Arc<Mutex<[u8; PAGE_SIZE]>>;

/// Allocate a zeroed frame buffer.
pub fn new_frame_buf() -> FrameBuf {
    Arc::new(Mutex::new([0u8; PAGE_SIZE]))
}

/// Non-owning back-reference from a frame to the page resident in it and
/// to the address space holding its translation.
#[derive(Clone)]
pub(crate) struct FrameOwner {
    pub page: Weak<Mutex<Page>>,
    pub map: Weak<Mutex<PageMap>>,
    pub va: u64,
}

struct Frame {
    kva: FrameBuf,
    owner: Option<FrameOwner>,
}

struct FrameTable {
    /// Arena; a `None` slot is free for reuse.
    frames: Vec<Option<Frame>>,
    /// Circular victim list of live frames, in allocation order.
    clock: Vec<FrameId>,
    /// Second-chance cursor into `clock`.
    hand: usize,
    /// Recycled arena slots.
    free: Vec<FrameId>,
}

/// The process-wide frame pool.
pub struct FramePool {
    capacity: usize,
    table: Mutex<FrameTable>,
    allocated: AtomicU64,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            table: Mutex::new(FrameTable {
                frames: Vec::new(),
                clock: Vec::new(),
                hand: 0,
                free: Vec::new(),
            }),
            allocated: AtomicU64::new(0),
        }
    }

    /// Frames currently live.
    pub fn used(&self) -> usize {
        self.table.lock().clock.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames handed out over the pool's lifetime.
    pub fn total_allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Take a fresh frame if the pool is below capacity. The caller owns
    /// the returned frame until it sets an owner or releases it.
    pub(crate) fn try_alloc(&self) -> Option<(FrameId, FrameBuf)> {
        let mut t = self.table.lock();
        if t.clock.len() >= self.capacity {
            return None;
        }
        let kva = new_frame_buf();
        let frame = Frame {
            kva: kva.clone(),
            owner: None,
        };
        let id = match t.free.pop() {
            Some(id) => {
                t.frames[id] = Some(frame);
                id
            }
            None => {
                t.frames.push(Some(frame));
                t.frames.len() - 1
            }
        };
        t.clock.push(id);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some((id, kva))
    }

    /// Advance the second-chance cursor one step and return a snapshot of
    /// the candidate under it. Accessed-bit inspection happens outside the
    /// pool lock.
    pub(crate) fn cursor_next(&self) -> Option<(FrameId, FrameBuf, Option<FrameOwner>)> {
        let mut t = self.table.lock();
        let len = t.clock.len();
        if len == 0 {
            return None;
        }
        if t.hand >= len {
            t.hand = 0;
        }
        let id = t.clock[t.hand];
        t.hand = (t.hand + 1) % len;
        let frame = t.frames[id].as_ref()?;
        Some((id, frame.kva.clone(), frame.owner.clone()))
    }

    /// Record which page now resides in `id`.
    pub(crate) fn set_owner(&self, id: FrameId, owner: FrameOwner) {
        let mut t = self.table.lock();
        if let Some(Some(frame)) = t.frames.get_mut(id) {
            frame.owner = Some(owner);
        }
    }

    /// Detach the resident page from `id`, keeping the frame live.
    pub(crate) fn clear_owner(&self, id: FrameId) {
        let mut t = self.table.lock();
        if let Some(Some(frame)) = t.frames.get_mut(id) {
            frame.owner = None;
        }
    }

    /// Unlink `id` from the victim list and free it.
    pub(crate) fn release(&self, id: FrameId) {
        let mut t = self.table.lock();
        if let Some(pos) = t.clock.iter().position(|&f| f == id) {
            t.clock.remove(pos);
            // keep the cursor on the same successor
            if t.hand > pos {
                t.hand -= 1;
            }
            let len = t.clock.len();
            t.hand = if len == 0 { 0 } else { t.hand % len };
        }
        if let Some(slot) = t.frames.get_mut(id) {
            *slot = None;
        }
        t.free.push(id);
    }

    /// Zero a frame before hand-out.
    pub(crate) fn scrub(kva: &FrameBuf) {
        kva.lock().fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_limit() {
        let pool = FramePool::new(2);
        let a = pool.try_alloc().unwrap();
        let _b = pool.try_alloc().unwrap();
        assert!(pool.try_alloc().is_none());
        assert_eq!(pool.used(), 2);
        pool.release(a.0);
        assert_eq!(pool.used(), 1);
        assert!(pool.try_alloc().is_some());
        assert_eq!(pool.total_allocated(), 3);
    }

    #[test]
    fn test_fresh_frames_are_zeroed() {
        let pool = FramePool::new(1);
        let (_, kva) = pool.try_alloc().unwrap();
        assert!(kva.lock().iter().all(|&b| b == 0));
        kva.lock()[0] = 0xFF;
        FramePool::scrub(&kva);
        assert!(kva.lock().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_cursor_walks_circularly() {
        let pool = FramePool::new(3);
        let (a, _) = pool.try_alloc().unwrap();
        let (b, _) = pool.try_alloc().unwrap();
        let (c, _) = pool.try_alloc().unwrap();
        let walk: Vec<FrameId> = (0..6).filter_map(|_| pool.cursor_next().map(|s| s.0)).collect();
        assert_eq!(walk, alloc::vec![a, b, c, a, b, c]);
    }

    #[test]
    fn test_release_fixes_cursor() {
        let pool = FramePool::new(3);
        let (a, _) = pool.try_alloc().unwrap();
        let (b, _) = pool.try_alloc().unwrap();
        let (c, _) = pool.try_alloc().unwrap();
        assert_eq!(pool.cursor_next().unwrap().0, a);
        pool.release(b);
        // cursor skips the released frame and keeps cycling
        assert_eq!(pool.cursor_next().unwrap().0, c);
        assert_eq!(pool.cursor_next().unwrap().0, a);
    }
}
