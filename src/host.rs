use core::ffi::{CStr, c_void};

use crate::HookError;

/// Window handle of the host.
pub type Hwnd = *mut c_void;

/// A loaded host module. Hand it back to [`Host::release_module`].
#[derive(Debug, PartialEq, Eq)]
pub struct ModuleHandle(pub usize);

/// The parts of the host environment the hooks talk to.
///
/// Sending never blocks on a window that does not exist: implementations
/// return 0 for a null or dead window instead.
pub trait Host: Send + Sync {
    /// Maps a process-wide message name to its identifier, 0 on failure.
    fn register_message(&self, name: &CStr) -> u32;

    /// Synchronous delivery; returns whatever the window procedure returned.
    fn send_message(&self, hwnd: Hwnd, msg: u32, wparam: usize, lparam: isize) -> isize;

    /// Queues `msg` on the calling thread's own message queue.
    fn post_thread_message(&self, msg: u32, wparam: usize, lparam: isize) -> bool;

    fn parent_window(&self, hwnd: Hwnd) -> Option<Hwnd>;

    fn load_module(&self, name: &CStr) -> Result<ModuleHandle, HookError>;

    fn export_address(&self, module: &ModuleHandle, name: &CStr) -> Result<usize, HookError>;

    fn release_module(&self, module: ModuleHandle);
}
