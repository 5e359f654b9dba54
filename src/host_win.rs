use core::ffi::CStr;

use windows_sys::Win32::Foundation::{FreeLibrary, GetLastError, HMODULE};
use windows_sys::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows_sys::Win32::System::Threading::GetCurrentThreadId;
use windows_sys::Win32::UI::WindowsAndMessaging::{
    GetParent, IsWindow, PostThreadMessageW, RegisterWindowMessageA, SendMessageW,
};

use crate::HookError;
use crate::host::{Host, Hwnd, ModuleHandle};

/// [`Host`] backed by user32 and the loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct WinHost;

impl Host for WinHost {
    fn register_message(&self, name: &CStr) -> u32 {
        unsafe { RegisterWindowMessageA(name.as_ptr().cast()) }
    }

    fn send_message(&self, hwnd: Hwnd, msg: u32, wparam: usize, lparam: isize) -> isize {
        if hwnd.is_null() || unsafe { IsWindow(hwnd) } == 0 {
            return 0;
        }
        unsafe { SendMessageW(hwnd, msg, wparam, lparam) }
    }

    fn post_thread_message(&self, msg: u32, wparam: usize, lparam: isize) -> bool {
        unsafe { PostThreadMessageW(GetCurrentThreadId(), msg, wparam, lparam) != 0 }
    }

    fn parent_window(&self, hwnd: Hwnd) -> Option<Hwnd> {
        let parent = unsafe { GetParent(hwnd) };
        (!parent.is_null()).then_some(parent)
    }

    fn load_module(&self, name: &CStr) -> Result<ModuleHandle, HookError> {
        let module = unsafe { LoadLibraryA(name.as_ptr().cast()) };
        if module.is_null() {
            return Err(HookError::ModuleNotFound(format!(
                "{} (error {})",
                name.to_string_lossy(),
                unsafe { GetLastError() }
            )));
        }
        Ok(ModuleHandle(module as usize))
    }

    fn export_address(&self, module: &ModuleHandle, name: &CStr) -> Result<usize, HookError> {
        let proc = unsafe { GetProcAddress(module.0 as HMODULE, name.as_ptr().cast()) };
        proc.map(|f| f as usize)
            .ok_or_else(|| HookError::ExportNotFound(name.to_string_lossy().into_owned()))
    }

    fn release_module(&self, module: ModuleHandle) {
        unsafe { FreeLibrary(module.0 as HMODULE) };
    }
}
