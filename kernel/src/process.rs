//! Process Layer
//!
//! The thread/process surface the VM core plugs into: a process owns an
//! address space, remembers the stack-bottom marker and the last user
//! stack pointer, and routes page faults into the claim path or stack
//! growth. User memory accesses go through [`Process::read_bytes`] /
//! [`Process::write_bytes`], which translate like the hardware would and
//! restart after each handled fault.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::memory::paging::TranslateError;
use crate::memory::{
    file, is_kernel_address, page_offset, AddressSpace, PageType, Vm, VmError, VmResult,
    PAGE_SIZE, USER_STACK_TOP,
};
use crate::ramfs::File;

/// Saved registers handed to the fault handler by the trap layer. Only the
/// stack pointer matters to the VM core.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub rsp: u64,
}

/// A user process as the VM core sees it.
pub struct Process {
    vm: Arc<Vm>,
    aspace: Arc<AddressSpace>,
    /// Stack pointer saved on kernel entry; used when a fault arrives from
    /// kernel mode.
    saved_rsp: AtomicU64,
    /// Lowest address of the claimed stack region.
    stack_bottom: AtomicU64,
}

impl Process {
    pub fn new(vm: Arc<Vm>) -> Self {
        Self {
            vm,
            aspace: Arc::new(AddressSpace::new()),
            saved_rsp: AtomicU64::new(USER_STACK_TOP),
            stack_bottom: AtomicU64::new(USER_STACK_TOP),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    pub fn stack_bottom(&self) -> u64 {
        self.stack_bottom.load(Ordering::Relaxed)
    }

    /// Record the user stack pointer (trap save).
    pub fn set_user_rsp(&self, rsp: u64) {
        self.saved_rsp.store(rsp, Ordering::Relaxed);
    }

    pub fn user_rsp(&self) -> u64 {
        self.saved_rsp.load(Ordering::Relaxed)
    }

    /// Claim the first stack page just below the stack top.
    pub fn init_stack(&self) -> VmResult<()> {
        let first = USER_STACK_TOP - PAGE_SIZE as u64;
        self.vm
            .alloc_page(&self.aspace, PageType::ANON | PageType::STACK, first, true)?;
        self.vm.claim_page(&self.aspace, first)?;
        self.stack_bottom.store(first, Ordering::Relaxed);
        self.saved_rsp.store(USER_STACK_TOP, Ordering::Relaxed);
        Ok(())
    }

    /// Page fault entry. Returns whether the fault was resolved; a reject
    /// kills the faulting process at the trap layer.
    pub fn try_handle_fault(
        &self,
        tf: &TrapFrame,
        addr: u64,
        user: bool,
        _write: bool,
        not_present: bool,
    ) -> bool {
        let handled = self.handle_fault(tf, addr, user, not_present);
        self.vm.note_fault(handled);
        handled
    }

    fn handle_fault(&self, tf: &TrapFrame, addr: u64, user: bool, not_present: bool) -> bool {
        if addr == 0 || is_kernel_address(addr) {
            return false;
        }
        // a fault on a present page is a protection violation; fatal here
        if !not_present {
            return false;
        }
        match self.vm.claim_page(&self.aspace, addr) {
            Ok(()) => return true,
            Err(VmError::NotMapped) => {}
            Err(_) => return false,
        }
        // no page covers the address: stack growth window?
        let rsp = if user { tf.rsp } else { self.user_rsp() };
        let stack_lo = USER_STACK_TOP - self.vm.config().stack_max;
        if addr >= rsp.saturating_sub(8) && addr >= stack_lo && addr < USER_STACK_TOP {
            self.grow_stack()
        } else {
            false
        }
    }

    /// Add one anonymous stack page below the current bottom and claim it.
    fn grow_stack(&self) -> bool {
        let bottom = self.stack_bottom.load(Ordering::Relaxed);
        let stack_lo = USER_STACK_TOP - self.vm.config().stack_max;
        let new_bottom = bottom - PAGE_SIZE as u64;
        if new_bottom < stack_lo {
            return false;
        }
        if self
            .vm
            .alloc_page(
                &self.aspace,
                PageType::ANON | PageType::STACK,
                new_bottom,
                true,
            )
            .is_err()
        {
            return false;
        }
        if self.vm.claim_page(&self.aspace, new_bottom).is_err() {
            return false;
        }
        self.stack_bottom.store(new_bottom, Ordering::Relaxed);
        log::debug!("[VM] stack grew to {:#x}", new_bottom);
        true
    }

    /// Map `length` bytes of `file` at `addr` (see [`file::do_mmap`]).
    pub fn mmap(
        &self,
        addr: u64,
        length: usize,
        writable: bool,
        file: &File,
        offset: u64,
    ) -> VmResult<u64> {
        file::do_mmap(&self.vm, &self.aspace, addr, length, writable, file, offset)
    }

    /// Tear down the mapping at `addr` (see [`file::do_munmap`]).
    pub fn munmap(&self, addr: u64) -> VmResult<()> {
        file::do_munmap(&self.vm, &self.aspace, addr)
    }

    /// Duplicate this process's address space into a child, eagerly.
    pub fn fork(&self) -> VmResult<Process> {
        let child = Process::new(self.vm.clone());
        self.vm
            .copy_address_space(&child.aspace, &self.aspace)?;
        child
            .saved_rsp
            .store(self.user_rsp(), Ordering::Relaxed);
        child
            .stack_bottom
            .store(self.stack_bottom(), Ordering::Relaxed);
        Ok(child)
    }

    /// Release every page of the address space. Called on process exit;
    /// safe to call twice.
    pub fn exit(&self) {
        self.vm.kill_address_space(&self.aspace);
    }

    /// Copy `data` into user memory at `addr`, faulting pages in as the
    /// hardware would.
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> VmResult<()> {
        let mut va = addr;
        let mut done = 0;
        while done < data.len() {
            let off = page_offset(va);
            let n = (PAGE_SIZE - off).min(data.len() - done);
            let kva = self.translate_user(va, true)?;
            kva.lock()[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
            va += n as u64;
        }
        Ok(())
    }

    /// Copy user memory at `addr` into `buf`, faulting pages in as needed.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> VmResult<()> {
        let mut va = addr;
        let mut done = 0;
        while done < buf.len() {
            let off = page_offset(va);
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            let kva = self.translate_user(va, false)?;
            buf[done..done + n].copy_from_slice(&kva.lock()[off..off + n]);
            done += n;
            va += n as u64;
        }
        Ok(())
    }

    /// Translate one user access, restarting through the fault handler
    /// until it sticks or the fault is rejected.
    fn translate_user(&self, va: u64, write: bool) -> VmResult<crate::memory::FrameBuf> {
        loop {
            let attempt = self.aspace.page_map().lock().translate(va, write);
            let not_present = match attempt {
                Ok(kva) => return Ok(kva),
                Err(TranslateError::NotPresent) => true,
                Err(TranslateError::Protection) => false,
            };
            let tf = TrapFrame {
                rsp: self.user_rsp(),
            };
            if !self.try_handle_fault(&tf, va, true, write, not_present) {
                return Err(VmError::InvalidAccess);
            }
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.exit();
    }
}
