//! Inline patching of function prologues.
//!
//! The first instructions of the target are moved into a trampoline page
//! allocated near the target, followed by a jump back into the target. While
//! the patch is enabled the target starts with a 5-byte `jmp rel32` into a
//! relay at the head of the same page, which in turn jumps to the detour.
//!
//! ```text
//! target:      jmp relay              ; enabled only
//!              <rest of the function>
//!
//! page+0x00:   jmp qword ptr [detour]  ; relay (x64, x86 jumps straight)
//! page+0x20:   <stolen instructions>   ; trampoline = original behaviour
//!              jmp target+n
//! ```
//!
//! The other threads of the process are frozen while the head of the target
//! is rewritten. A thread caught on one of the moved instructions continues
//! at the same instruction on the other side.

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::HookError;
use crate::engine::{PatchBackend, PatchSite};
use crate::protect::ProtectGuard;

mod ip_map;
mod relocate;

#[cfg(windows)]
#[path = "patch/near_page_win.rs"]
mod near_page;

#[cfg(unix)]
#[path = "patch/near_page_unix.rs"]
mod near_page;

#[cfg(windows)]
#[path = "patch/freeze_win.rs"]
mod freeze;

#[cfg(unix)]
#[path = "patch/freeze_unix.rs"]
mod freeze;


#[cfg(unix)]
pub(crate) use near_page::protections;

use ip_map::{Direction, Fixup, IpMap};
use near_page::NearPage;
use relocate::{MAX_INST_LEN, decode_prologue, move_code_to_addr};

const JMP_INST_SIZE: usize = 5;
const TRAMPOLINE_OFFSET: usize = 0x20;

/// [`PatchBackend`] that rewrites function prologues in place.
#[derive(Default)]
pub struct InlineBackend;

impl PatchBackend for InlineBackend {
    type Site = InlinePatch;

    unsafe fn create(&self, target: usize, detour: usize) -> Result<InlinePatch, HookError> {
        unsafe { InlinePatch::create(target, detour) }
    }
}

/// A prepared prologue patch. Created disabled.
pub struct InlinePatch {
    target: usize,
    trampoline: usize,
    origin: [u8; JMP_INST_SIZE],
    jmp: [u8; JMP_INST_SIZE],
    ips: IpMap,
    enabled: AtomicBool,
    // keeps the relay and the trampoline mapped
    _page: NearPage,
}

impl InlinePatch {
    /// Builds the relay and the trampoline for `target` without touching it.
    ///
    /// # Safety
    ///
    /// Process may crash (instead of panic!) if:
    ///
    /// 1. `target` points into the middle of an instruction.
    /// 2. Code elsewhere in the function jumps back into the first 5 bytes.
    /// 3. `detour` does not have the signature of `target`.
    pub unsafe fn create(target: usize, detour: usize) -> Result<Self, HookError> {
        let available = match near_page::executable_len(target) {
            Some(len) if target != 0 => len,
            _ => return Err(HookError::InvalidTarget(target)),
        };
        // never read past the end of the mapping
        let len = available.min(JMP_INST_SIZE + MAX_INST_LEN);
        if len < JMP_INST_SIZE {
            return Err(HookError::FunctionTooShort(target));
        }
        let code = unsafe { slice::from_raw_parts(target as *const u8, len) };
        let stolen = decode_prologue(code, target as u64, JMP_INST_SIZE)?;

        let page = NearPage::allocate(target)?;
        let relay = write_relay(&page, detour);
        let trampoline = page.addr + TRAMPOLINE_OFFSET;
        let moved = move_code_to_addr(&stolen, trampoline as u64)?;
        if TRAMPOLINE_OFFSET + moved.code.len() > page.len {
            return Err(HookError::MoveCode);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                moved.code.as_ptr(),
                trampoline as *mut u8,
                moved.code.len(),
            )
        };

        let mut origin = [0u8; JMP_INST_SIZE];
        origin.copy_from_slice(&code[..JMP_INST_SIZE]);
        let jmp = jmp_rel32(target, relay).ok_or(HookError::MemorySearching)?;

        Ok(Self {
            target,
            trampoline,
            origin,
            jmp,
            ips: IpMap::new(target, trampoline, moved.offsets),
            enabled: AtomicBool::new(false),
            _page: page,
        })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Calling this address runs the original target.
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn write_head(&self, bytes: &[u8; JMP_INST_SIZE], direction: Direction) -> Result<(), HookError> {
        let guard = ProtectGuard::make_writable(self.target, JMP_INST_SIZE)?;
        let fixup = Fixup {
            map: &self.ips,
            direction,
        };
        let frozen = freeze::freeze_others(&fixup)?;
        unsafe { guard.write(bytes) };
        drop(frozen);
        Ok(())
    }
}

impl PatchSite for InlinePatch {
    fn original(&self) -> usize {
        self.trampoline
    }

    fn enable(&self) -> Result<(), HookError> {
        self.write_head(&self.jmp, Direction::IntoTrampoline)?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn disable(&self) -> Result<(), HookError> {
        self.write_head(&self.origin, Direction::BackToTarget)?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }
}

// When the InlinePatch drops, the target must run its own code again.
impl Drop for InlinePatch {
    fn drop(&mut self) {
        if self.is_enabled() {
            self.disable().unwrap_or_default();
        }
    }
}

/// Writes the jump to `detour` at the head of the page and returns the address
/// the target has to jump to.
#[cfg(target_pointer_width = "64")]
fn write_relay(page: &NearPage, detour: usize) -> usize {
    let mut relay = [0u8; 14];
    // jmp qword ptr [rip+0]
    relay[..6].copy_from_slice(&[0xff, 0x25, 0, 0, 0, 0]);
    relay[6..].copy_from_slice(&(detour as u64).to_le_bytes());
    unsafe { std::ptr::copy_nonoverlapping(relay.as_ptr(), page.addr as *mut u8, relay.len()) };
    page.addr
}

#[cfg(target_pointer_width = "32")]
fn write_relay(_page: &NearPage, detour: usize) -> usize {
    detour
}

#[cfg(target_pointer_width = "64")]
fn jmp_rel32(from: usize, to: usize) -> Option<[u8; JMP_INST_SIZE]> {
    let rel = i32::try_from(to as i64 - (from as i64 + JMP_INST_SIZE as i64)).ok()?;
    Some(encode_jmp(rel as u32))
}

// the displacement wraps around the 4 GiB address space
#[cfg(target_pointer_width = "32")]
fn jmp_rel32(from: usize, to: usize) -> Option<[u8; JMP_INST_SIZE]> {
    let rel = (to as u32).wrapping_sub((from as u32).wrapping_add(JMP_INST_SIZE as u32));
    Some(encode_jmp(rel))
}

fn encode_jmp(rel: u32) -> [u8; JMP_INST_SIZE] {
    let mut buf = [0u8; JMP_INST_SIZE];
    buf[0] = 0xe9;
    buf[1..].copy_from_slice(&rel.to_le_bytes());
    buf
}
