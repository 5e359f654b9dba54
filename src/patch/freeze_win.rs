use crate::HookError;

use super::ip_map::Fixup;

use std::mem::{size_of, zeroed};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::Debug::{CONTEXT, GetThreadContext, SetThreadContext};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread,
    THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

#[cfg(target_arch = "x86_64")]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_AMD64 as CONTEXT_CONTROL;
#[cfg(target_arch = "x86")]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT_CONTROL_X86 as CONTEXT_CONTROL;

/// Every other thread of the process, suspended until this drops.
pub(super) struct Frozen {
    threads: Vec<HANDLE>,
}

impl Drop for Frozen {
    fn drop(&mut self) {
        for &thread in &self.threads {
            unsafe {
                ResumeThread(thread);
                CloseHandle(thread);
            }
        }
    }
}

/// Suspends every other thread and moves the ones caught inside the range
/// about to be rewritten.
///
/// Nothing may allocate between the first suspension and the drop of the
/// result: a suspended thread can hold the heap lock.
pub(super) fn freeze_others(fixup: &Fixup<'_>) -> Result<Frozen, HookError> {
    let ids = other_threads()?;
    let mut threads = Vec::with_capacity(ids.len());
    for id in ids {
        let thread = unsafe {
            OpenThread(
                THREAD_SUSPEND_RESUME
                    | THREAD_GET_CONTEXT
                    | THREAD_SET_CONTEXT
                    | THREAD_QUERY_INFORMATION,
                0,
                id,
            )
        };
        if thread.is_null() {
            // exited since the snapshot
            continue;
        }
        if unsafe { SuspendThread(thread) } == u32::MAX {
            unsafe { CloseHandle(thread) };
            continue;
        }
        move_ip(thread, fixup);
        threads.push(thread);
    }
    Ok(Frozen { threads })
}

fn other_threads() -> Result<Vec<u32>, HookError> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(HookError::ThreadFreeze(unsafe { GetLastError() }));
    }
    let (process, current) = unsafe { (GetCurrentProcessId(), GetCurrentThreadId()) };
    let mut entry: THREADENTRY32 = unsafe { zeroed() };
    entry.dwSize = size_of::<THREADENTRY32>() as u32;

    let mut ids = vec![];
    let mut more = unsafe { Thread32First(snapshot, &mut entry) } != 0;
    while more {
        if entry.th32OwnerProcessID == process && entry.th32ThreadID != current {
            ids.push(entry.th32ThreadID);
        }
        more = unsafe { Thread32Next(snapshot, &mut entry) } != 0;
    }
    unsafe { CloseHandle(snapshot) };
    Ok(ids)
}

fn move_ip(thread: HANDLE, fixup: &Fixup<'_>) {
    let mut context: CONTEXT = unsafe { zeroed() };
    context.ContextFlags = CONTEXT_CONTROL;
    // also waits for the suspension to take effect
    if unsafe { GetThreadContext(thread, &mut context) } == 0 {
        return;
    }
    let ip = ip_of(&mut context);
    if let Some(moved) = fixup.apply(*ip as usize) {
        *ip = moved as _;
        unsafe { SetThreadContext(thread, &context) };
    }
}

#[cfg(target_arch = "x86_64")]
fn ip_of(context: &mut CONTEXT) -> &mut u64 {
    &mut context.Rip
}

#[cfg(target_arch = "x86")]
fn ip_of(context: &mut CONTEXT) -> &mut u32 {
    &mut context.Eip
}
