//! RAM Filesystem
//!
//! In-memory file objects for the kernel. Memory-mapped files hold a
//! private [`File`] handle obtained through [`File::reopen`], so a close on
//! the original descriptor does not tear the mapping down. Writes never
//! grow a file; the on-disk filesystem this stands in for has no file
//! growth either.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Shared byte store behind one or more [`File`] handles.
pub struct Inode {
    data: Mutex<Vec<u8>>,
}

impl Inode {
    fn new(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(content.to_vec()),
        })
    }
}

/// An open file: a shared inode plus a per-handle position.
pub struct File {
    inode: Arc<Inode>,
    pos: AtomicU64,
}

impl File {
    /// Create a standalone file from `content` (not registered anywhere).
    pub fn from_bytes(content: &[u8]) -> Self {
        Self {
            inode: Inode::new(content),
            pos: AtomicU64::new(0),
        }
    }

    /// Fresh handle to the same inode, positioned at the start.
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: AtomicU64::new(0),
        }
    }

    /// File length in bytes.
    pub fn length(&self) -> usize {
        self.inode.data.lock().len()
    }

    /// Read up to `buf.len()` bytes at `offset`, ignoring the handle
    /// position. Returns the number of bytes read (short at end of file).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.inode.data.lock();
        let off = offset as usize;
        if off >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        n
    }

    /// Write up to `buf.len()` bytes at `offset`, ignoring the handle
    /// position. Does not grow the file; returns the number of bytes
    /// actually written.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.inode.data.lock();
        let off = offset as usize;
        if off >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - off);
        data[off..off + n].copy_from_slice(&buf[..n]);
        n
    }

    /// Move the handle position.
    pub fn seek(&self, pos: u64) {
        self.pos.store(pos, Ordering::Relaxed);
    }

    /// Current handle position.
    pub fn tell(&self) -> u64 {
        self.pos.load(Ordering::Relaxed)
    }

    /// Read from the handle position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let pos = self.tell();
        let n = self.read_at(buf, pos);
        self.pos.store(pos + n as u64, Ordering::Relaxed);
        n
    }
}

impl Clone for File {
    fn clone(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            pos: AtomicU64::new(self.tell()),
        }
    }
}

/// Path registry over inodes.
pub struct RamFs {
    entries: Mutex<BTreeMap<String, Arc<Inode>>>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Create (or truncate-and-replace) a file at `path`.
    pub fn create(&self, path: &str, content: &[u8]) -> File {
        let inode = Inode::new(content);
        self.entries.lock().insert(String::from(path), inode.clone());
        File {
            inode,
            pos: AtomicU64::new(0),
        }
    }

    /// Open an existing file.
    pub fn open(&self, path: &str) -> Option<File> {
        let inode = self.entries.lock().get(path)?.clone();
        Some(File {
            inode,
            pos: AtomicU64::new(0),
        })
    }

    /// Remove a path. Handles already open keep the inode alive.
    pub fn remove(&self, path: &str) -> bool {
        self.entries.lock().remove(path).is_some()
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}
