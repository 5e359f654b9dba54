use crate::HookError;

#[cfg(windows)]
use core::ffi::c_void;
#[cfg(unix)]
use crate::patch::protections;
#[cfg(unix)]
use libc::{__errno_location, c_void, mprotect, sysconf};
#[cfg(windows)]
use windows_sys::Win32::Foundation::GetLastError;
#[cfg(windows)]
use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
#[cfg(windows)]
use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READWRITE, VirtualProtect};
#[cfg(windows)]
use windows_sys::Win32::System::Threading::GetCurrentProcess;

/// Makes a code range writable for as long as the guard lives.
///
/// Dropping the guard puts the previous protection back.
pub(crate) struct ProtectGuard {
    addr: usize,
    len: usize,
    // (start, len, protection) of every piece to restore
    old: Vec<(usize, usize, u32)>,
}

impl ProtectGuard {
    pub fn make_writable(addr: usize, len: usize) -> Result<Self, HookError> {
        let old = modify_mem_protect_to_rwe(addr, len)?;
        Ok(Self { addr, len, old })
    }

    /// Copies `bytes` over the guarded range and flushes the instruction
    /// cache for it.
    ///
    /// # Safety
    ///
    /// The range must be mapped and `bytes` must fit into it.
    pub unsafe fn write(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.len);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.addr as *mut u8, bytes.len()) };
        flush_instruction_cache(self.addr, bytes.len());
    }
}

impl Drop for ProtectGuard {
    fn drop(&mut self) {
        for &(start, len, prot) in &self.old {
            recover_mem_protect(start, len, prot);
        }
    }
}

#[cfg(windows)]
fn modify_mem_protect_to_rwe(addr: usize, len: usize) -> Result<Vec<(usize, usize, u32)>, HookError> {
    let mut old_prot: u32 = 0;
    let ret = unsafe {
        VirtualProtect(
            addr as *const c_void,
            len,
            PAGE_EXECUTE_READWRITE,
            &mut old_prot,
        )
    };
    if ret == 0 {
        Err(HookError::MemoryProtect(unsafe { GetLastError() }))
    } else {
        Ok(vec![(addr, len, old_prot)])
    }
}

#[cfg(windows)]
fn recover_mem_protect(addr: usize, len: usize, old: u32) {
    let mut old_prot: u32 = 0;
    unsafe { VirtualProtect(addr as *const c_void, len, old, &mut old_prot) };
}

#[cfg(windows)]
fn flush_instruction_cache(addr: usize, len: usize) {
    unsafe { FlushInstructionCache(GetCurrentProcess(), addr as *const c_void, len) };
}

// x86 keeps instruction fetch coherent with stores
#[cfg(unix)]
fn flush_instruction_cache(_addr: usize, _len: usize) {}

#[cfg(unix)]
pub(crate) fn page_size() -> usize {
    let size = unsafe { sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(unix)]
fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len + page - 1) & !(page - 1);
    (start, end - start)
}

#[cfg(unix)]
fn modify_mem_protect_to_rwe(addr: usize, len: usize) -> Result<Vec<(usize, usize, u32)>, HookError> {
    let (start, span) = page_span(addr, len);
    let page = page_size();
    let old = protections((start..start + span).step_by(page))?
        .into_iter()
        .map(|(page_start, prot)| (page_start, page, prot as u32))
        .collect();
    let ret = unsafe {
        mprotect(
            start as *mut c_void,
            span,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    };
    if ret != 0 {
        let err = unsafe { *(__errno_location()) };
        Err(HookError::MemoryProtect(err as u32))
    } else {
        Ok(old)
    }
}

#[cfg(unix)]
fn recover_mem_protect(addr: usize, len: usize, old: u32) {
    unsafe { mprotect(addr as *mut c_void, len, old as i32) };
}
