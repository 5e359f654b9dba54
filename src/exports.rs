//! Symbols the loader calls.

use core::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use windows_sys::Win32::System::SystemServices::DLL_PROCESS_DETACH;

use crate::config::{HookConfig, LogSettings};
use crate::hooks::detours;
use crate::host_win::WinHost;
use crate::patch::InlineBackend;
use crate::registry::Registry;
use crate::{HookError, Status, logging};

pub(crate) type NativeRegistry = Registry<InlineBackend, WinHost>;

// Detours carry no user data, so they find the registry here.
static REGISTRY: OnceLock<NativeRegistry> = OnceLock::new();

fn registry() -> &'static NativeRegistry {
    REGISTRY.get_or_init(|| {
        // no console to complain to; the host runs on without a log
        let _ = logging::init(&LogSettings::from_env());
        Registry::new(HookConfig::from_env(), InlineBackend, WinHost, detours::table())
    })
}

pub(crate) fn installed() -> Option<&'static NativeRegistry> {
    REGISTRY.get()
}

fn guarded(f: impl FnOnce() -> Result<(), HookError>) -> i32 {
    let status = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(ret) => Status::from(ret),
        Err(_) => Status::Unknown,
    };
    status as i32
}

/// Installs the steady-state interceptors. Only the first call has effect.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "system" fn Initialize() -> i32 {
    guarded(|| registry().initialize())
}

/// Hooks navigation on `browser`, an `IShellBrowser`. Only the first call
/// with a non-null browser has effect.
///
/// # Safety
///
/// `browser` must be null or a live `IShellBrowser`.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "system" fn InitShellBrowserHook(browser: *mut c_void) -> i32 {
    guarded(|| unsafe { registry().init_shell_browser_hook(browser) })
}

/// Removes every interception. Safe to call at any time, any number of times.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "system" fn Dispose() -> i32 {
    guarded(|| {
        if let Some(registry) = installed() {
            registry.dispose();
        }
        Ok(())
    })
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(_module: *mut c_void, reason: u32, _reserved: *mut c_void) -> i32 {
    if reason == DLL_PROCESS_DETACH {
        Dispose();
    }
    1
}
