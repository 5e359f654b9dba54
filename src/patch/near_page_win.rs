use crate::HookError;

use core::ffi::c_void;
use std::mem::{MaybeUninit, size_of};
use windows_sys::Win32::Foundation::{ERROR_INVALID_PARAMETER, GetLastError};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION,
    PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
    VirtualAlloc, VirtualFree, VirtualQuery,
};

const PAGE_LEN: usize = 4096;

enum QueryResult {
    Success(usize),
    NotUsable(usize, usize),
    OverLimit,
    Fail(u32),
}

/// One executable page that lives close enough to a hooked function for
/// `rel32` jumps and rip-relative operands to reach across.
pub(super) struct NearPage {
    pub addr: usize,
    pub len: usize,
}

impl Drop for NearPage {
    fn drop(&mut self) {
        unsafe { VirtualFree(self.addr as *mut c_void, 0, MEM_RELEASE) };
    }
}

impl NearPage {
    pub fn allocate(target: usize) -> Result<Self, HookError> {
        let addr = if cfg!(target_pointer_width = "64") {
            allocate_internal(&Bound::new(target as u64))?
        } else {
            allocate_anywhere()?
        };
        Ok(Self {
            addr,
            len: PAGE_LEN,
        })
    }
}

fn query(addr: usize) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut mbi = MaybeUninit::<MEMORY_BASIC_INFORMATION>::zeroed();
    let ret = unsafe {
        VirtualQuery(
            addr as *const c_void,
            mbi.as_mut_ptr(),
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if ret == 0 {
        None
    } else {
        Some(unsafe { mbi.assume_init() })
    }
}

/// How many bytes of committed executable memory start at `addr`, if it is
/// executable at all.
pub(super) fn executable_len(addr: usize) -> Option<usize> {
    const EXECUTABLE: u32 =
        PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;
    query(addr)
        .filter(|mbi| mbi.State == MEM_COMMIT && mbi.Protect & EXECUTABLE != 0)
        .map(|mbi| mbi.BaseAddress as usize + mbi.RegionSize - addr)
}

fn query_and_alloc(addr: u64) -> QueryResult {
    let Some(mbi) = query(addr as usize) else {
        let last_err = unsafe { GetLastError() };
        // ERROR_INVALID_PARAMETER means the address is above the highest
        // address accessible to the process
        return if last_err == ERROR_INVALID_PARAMETER {
            QueryResult::OverLimit
        } else {
            QueryResult::Fail(last_err)
        };
    };
    if mbi.State == MEM_FREE && mbi.RegionSize >= PAGE_LEN {
        let mem = unsafe {
            VirtualAlloc(
                mbi.BaseAddress,
                PAGE_LEN,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if mem.is_null() {
            QueryResult::NotUsable(mbi.BaseAddress as usize, mbi.RegionSize)
        } else {
            QueryResult::Success(mem as usize)
        }
    } else {
        QueryResult::NotUsable(mbi.BaseAddress as usize, mbi.RegionSize)
    }
}

fn allocate_anywhere() -> Result<usize, HookError> {
    let mem = unsafe {
        VirtualAlloc(
            std::ptr::null(),
            PAGE_LEN,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if mem.is_null() {
        Err(HookError::MemoryAllocation(unsafe { GetLastError() }))
    } else {
        Ok(mem as usize)
    }
}

fn allocate_internal(bnd: &Bound) -> Result<usize, HookError> {
    let mut cur_addr = bnd.middle();
    while cur_addr < bnd.max {
        match query_and_alloc(cur_addr) {
            QueryResult::Success(addr) => return Ok(addr),
            QueryResult::NotUsable(base, size) => {
                let step = if size > 0 { size } else { PAGE_LEN };
                cur_addr = (base as u64).saturating_add(step as u64);
            }
            QueryResult::OverLimit => break,
            QueryResult::Fail(e) => return Err(HookError::MemoryAllocation(e)),
        }
    }
    cur_addr = bnd.middle();
    while cur_addr > bnd.min {
        match query_and_alloc(cur_addr) {
            QueryResult::Success(addr) => return Ok(addr),
            QueryResult::NotUsable(base, _) => {
                cur_addr = (base as u64).saturating_sub(PAGE_LEN as u64);
            }
            QueryResult::Fail(e) => return Err(HookError::MemoryAllocation(e)),
            QueryResult::OverLimit => return Err(HookError::MemoryAllocation(0)),
        }
    }
    Err(HookError::MemorySearching)
}

struct Bound {
    min: u64,
    max: u64,
}

impl Bound {
    fn new(init_addr: u64) -> Self {
        Self {
            min: init_addr.saturating_sub(i32::MAX as u64),
            max: init_addr.saturating_add(i32::MAX as u64),
        }
    }

    fn middle(&self) -> u64 {
        self.min / 2 + self.max / 2
    }
}
