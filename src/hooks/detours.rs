//! Native entry points patched into the host.
//!
//! A detour carries no context, so each one looks up the process registry and
//! the original it replaces, then hands over to the matching handler.
//!
//! A detour only runs after its target and original were published, and the
//! registry is never dropped, so the unresolved branches below can't be taken
//! while a jump into them exists. They return a failure rather than guess.

use core::ffi::c_void;

use uguid::Guid;

use crate::com::{E_UNEXPECTED, Hresult, SfvCreate};
use crate::exports::{NativeRegistry, installed};
use crate::host::Hwnd;
use crate::registry::{DetourTable, HookId};

type CoCreateInstanceFn = unsafe extern "system" fn(
    *const Guid,
    *mut c_void,
    u32,
    *const Guid,
    *mut *mut c_void,
) -> Hresult;
type RegisterDragDropFn = unsafe extern "system" fn(Hwnd, *mut c_void) -> Hresult;
type ShCreateShellFolderViewFn =
    unsafe extern "system" fn(*const SfvCreate, *mut *mut c_void) -> Hresult;
type CreateViewWindow3Fn = unsafe extern "system" fn(
    *mut c_void,
    *mut c_void,
    *mut c_void,
    u32,
    u32,
    u32,
    i32,
    *const Guid,
    *const c_void,
    *mut Hwnd,
) -> Hresult;
type MessageSfvcbFn = unsafe extern "system" fn(*mut c_void, u32, usize, isize) -> Hresult;
type BrowseObjectFn = unsafe extern "system" fn(*mut c_void, *const c_void, u32) -> Hresult;
type ReturnRawElementProviderFn =
    unsafe extern "system" fn(Hwnd, usize, isize, *mut c_void) -> isize;
type QueryInterfaceFn =
    unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> Hresult;
type TravelToEntryFn = unsafe extern "system" fn(*mut c_void, *mut c_void, *mut c_void) -> Hresult;

/// Addresses of every detour below.
pub(crate) fn table() -> DetourTable {
    DetourTable::empty()
        .with(HookId::ObjectCreationFilter, co_create_instance as usize)
        .with(HookId::DragDropRegistration, register_drag_drop as usize)
        .with(HookId::ViewCallbackBootstrap, sh_create_shell_folder_view as usize)
        .with(HookId::HeaderPolicyFilter, create_view_window3 as usize)
        .with(HookId::ViewMessageFilter, message_sfvcb as usize)
        .with(HookId::NavigationVeto, browse_object as usize)
        .with(HookId::AccessibilityBootstrap, return_raw_element_provider as usize)
        .with(HookId::AccessibilityQueryFilter, element_query_interface as usize)
        .with(HookId::TravelEntryOverride, travel_to_entry as usize)
}

/// The registry plus what runs the host's behaviour behind `id`, as an `F`.
unsafe fn resolve<F: Copy>(id: HookId) -> Option<(&'static NativeRegistry, F)> {
    let registry = installed()?;
    let original = unsafe { registry.passthrough::<F>(id) }?;
    Some((registry, original))
}

unsafe extern "system" fn co_create_instance(
    rclsid: *const Guid,
    outer: *mut c_void,
    context: u32,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<CoCreateInstanceFn>(HookId::ObjectCreationFilter) })
    else {
        return E_UNEXPECTED;
    };
    unsafe {
        registry.on_co_create_instance(riid.as_ref(), ppv, || {
            original(rclsid, outer, context, riid, ppv)
        })
    }
}

unsafe extern "system" fn register_drag_drop(hwnd: Hwnd, drop_target: *mut c_void) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<RegisterDragDropFn>(HookId::DragDropRegistration) })
    else {
        return E_UNEXPECTED;
    };
    registry.on_register_drag_drop(hwnd, drop_target, |drop_target| unsafe {
        original(hwnd, drop_target)
    })
}

unsafe extern "system" fn sh_create_shell_folder_view(
    create: *const SfvCreate,
    ppsv: *mut *mut c_void,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<ShCreateShellFolderViewFn>(HookId::ViewCallbackBootstrap) })
    else {
        return E_UNEXPECTED;
    };
    unsafe { registry.on_create_shell_folder_view(create, ppsv, || original(create, ppsv)) }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn create_view_window3(
    this: *mut c_void,
    owner: *mut c_void,
    previous: *mut c_void,
    view_flags: u32,
    mask: u32,
    flags: u32,
    mode: i32,
    view_id: *const Guid,
    rect: *const c_void,
    hwnd_view: *mut Hwnd,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<CreateViewWindow3Fn>(HookId::HeaderPolicyFilter) })
    else {
        return E_UNEXPECTED;
    };
    unsafe {
        registry.on_create_view_window3(owner, mask, flags, |mask, flags| {
            original(
                this, owner, previous, view_flags, mask, flags, mode, view_id, rect, hwnd_view,
            )
        })
    }
}

unsafe extern "system" fn message_sfvcb(
    this: *mut c_void,
    msg: u32,
    wparam: usize,
    lparam: isize,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<MessageSfvcbFn>(HookId::ViewMessageFilter) })
    else {
        return E_UNEXPECTED;
    };
    registry.on_view_callback_message(msg, wparam, || unsafe {
        original(this, msg, wparam, lparam)
    })
}

unsafe extern "system" fn browse_object(
    this: *mut c_void,
    pidl: *const c_void,
    flags: u32,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<BrowseObjectFn>(HookId::NavigationVeto) })
    else {
        return E_UNEXPECTED;
    };
    unsafe { registry.on_browse_object(this, pidl, flags, |flags| original(this, pidl, flags)) }
}

unsafe extern "system" fn return_raw_element_provider(
    hwnd: Hwnd,
    wparam: usize,
    lparam: isize,
    element: *mut c_void,
) -> isize {
    let Some((registry, original)) =
        (unsafe { resolve::<ReturnRawElementProviderFn>(HookId::AccessibilityBootstrap) })
    else {
        return 0;
    };
    unsafe {
        registry.on_return_raw_element_provider(hwnd, lparam, element, || {
            original(hwnd, wparam, lparam, element)
        })
    }
}

unsafe extern "system" fn element_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<QueryInterfaceFn>(HookId::AccessibilityQueryFilter) })
    else {
        return E_UNEXPECTED;
    };
    unsafe { registry.on_element_query_interface(riid.as_ref(), ppv, || original(this, riid, ppv)) }
}

unsafe extern "system" fn travel_to_entry(
    this: *mut c_void,
    site: *mut c_void,
    entry: *mut c_void,
) -> Hresult {
    let Some((registry, original)) =
        (unsafe { resolve::<TravelToEntryFn>(HookId::TravelEntryOverride) })
    else {
        return E_UNEXPECTED;
    };
    unsafe { registry.on_travel_to_entry(site, || original(this, site, entry)) }
}
