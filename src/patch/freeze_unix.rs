//! Freezes the other threads of the process with a signal.
//!
//! Each thread parks in the signal handler until the rewrite is done, then
//! moves its own saved instruction pointer if it was caught inside the
//! rewritten range.

use crate::HookError;

use super::ip_map::Fixup;

use libc::{c_int, c_void, siginfo_t};
use parking_lot::Mutex;
use std::fs;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const PARK_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(target_arch = "x86_64")]
const REG_IP: usize = libc::REG_RIP as usize;
#[cfg(target_arch = "x86")]
const REG_IP: usize = libc::REG_EIP as usize;

// one freeze at a time
static SESSION: Mutex<()> = Mutex::new(());
static ARRIVED: AtomicUsize = AtomicUsize::new(0);
static DEPARTED: AtomicUsize = AtomicUsize::new(0);
static RELEASED: AtomicBool = AtomicBool::new(true);
static FIXUP: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// A realtime signal nothing else in the process is expected to use.
fn park_signal() -> c_int {
    libc::SIGRTMAX() - 2
}

extern "C" fn park(_sig: c_int, _info: *mut siginfo_t, context: *mut c_void) {
    ARRIVED.fetch_add(1, Ordering::AcqRel);
    while !RELEASED.load(Ordering::Acquire) {
        unsafe { libc::sched_yield() };
    }
    let fixup = FIXUP.load(Ordering::Acquire) as *const Fixup<'static>;
    if let Some(fixup) = unsafe { fixup.as_ref() } {
        let context = context as *mut libc::ucontext_t;
        let ip = unsafe { &mut (*context).uc_mcontext.gregs[REG_IP] };
        if let Some(moved) = fixup.apply(*ip as usize) {
            *ip = moved as libc::greg_t;
        }
    }
    DEPARTED.fetch_add(1, Ordering::AcqRel);
}

fn install_handler() -> bool {
    static INSTALLED: OnceLock<bool> = OnceLock::new();
    *INSTALLED.get_or_init(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction =
            park as extern "C" fn(c_int, *mut siginfo_t, *mut c_void) as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(park_signal(), &action, ptr::null_mut()) == 0
    })
}

/// Every other thread of the process, parked until this drops.
pub(super) struct Frozen<'a> {
    _session: parking_lot::MutexGuard<'static, ()>,
    _fixup: &'a Fixup<'a>,
}

impl Drop for Frozen<'_> {
    fn drop(&mut self) {
        release();
    }
}

fn release() {
    RELEASED.store(true, Ordering::Release);
    let deadline = Instant::now() + PARK_TIMEOUT;
    while DEPARTED.load(Ordering::Acquire) < ARRIVED.load(Ordering::Acquire)
        && Instant::now() < deadline
    {
        std::thread::yield_now();
    }
    FIXUP.store(ptr::null_mut(), Ordering::Release);
}

/// Parks every other thread and has the ones caught inside the range about
/// to be rewritten move on release.
///
/// Nothing may allocate between the first signal and the drop of the
/// result: a parked thread can hold the allocator lock.
pub(super) fn freeze_others<'a>(fixup: &'a Fixup<'a>) -> Result<Frozen<'a>, HookError> {
    if !install_handler() {
        return Err(HookError::ThreadFreeze(last_errno()));
    }
    let session = SESSION.lock();
    let tids = other_threads()?;

    ARRIVED.store(0, Ordering::Release);
    DEPARTED.store(0, Ordering::Release);
    FIXUP.store(fixup as *const Fixup<'_> as *mut c_void, Ordering::Release);
    RELEASED.store(false, Ordering::Release);

    let pid = unsafe { libc::getpid() };
    let signal = park_signal();
    let mut expected = 0;
    for tid in tids {
        let ret = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) };
        // a thread that exited in between is not waited for
        if ret == 0 {
            expected += 1;
        }
    }

    let deadline = Instant::now() + PARK_TIMEOUT;
    while ARRIVED.load(Ordering::Acquire) < expected {
        if Instant::now() >= deadline {
            release();
            return Err(HookError::ThreadFreeze(libc::ETIMEDOUT as u32));
        }
        std::thread::yield_now();
    }
    Ok(Frozen {
        _session: session,
        _fixup: fixup,
    })
}

fn other_threads() -> Result<Vec<libc::pid_t>, HookError> {
    let current = unsafe { libc::syscall(libc::SYS_gettid) } as libc::pid_t;
    let mut tids = vec![];
    for entry in fs::read_dir("/proc/self/task")? {
        let Some(tid) = entry?
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        if tid != current {
            tids.push(tid);
        }
    }
    Ok(tids)
}

fn last_errno() -> u32 {
    (unsafe { *libc::__errno_location() }) as u32
}
