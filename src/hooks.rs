//! What every interceptor does with a call.
//!
//! Each handler receives the decoded arguments plus a closure running the
//! original behaviour, and decides whether and how to call it. The native
//! detours only unpack their arguments into these calls, so the decisions
//! run the same under test as inside the host.
//!
//! The original may itself re-enter other interceptors. Handlers keep no
//! state across that call apart from the bootstrap flags.

use core::ffi::c_void;
use core::ptr;

use tracing::{debug, trace, warn};
use uguid::Guid;

use crate::com::{
    BrowseFlags, E_NOINTERFACE, FolderFlags, ForeignRef, Hresult, IID_CDEFVIEW,
    IID_INAMESPACE_TREE_CONTROL, IID_INAMESPACE_TREE_CONTROL2,
    IID_IRAW_ELEMENT_PROVIDER_ADVISE_EVENTS, IID_ISHELL_BROWSER, IID_ISHELL_VIEW3, OBJID_CLIENT,
    S_FALSE, S_OK, SFVM_LISTREFRESHED, SfvCreate, succeeded,
};
use crate::engine::PatchBackend;
use crate::host::{Host, Hwnd};
use crate::registry::{HookId, Registry};

#[cfg(all(windows, any(target_arch = "x86", target_arch = "x86_64")))]
pub(crate) mod detours;


impl<B: PatchBackend, H: Host> Registry<B, H> {
    /// `CoCreateInstance`: reports new namespace tree controls.
    ///
    /// # Safety
    ///
    /// `ppv` must be null or valid for reads once `original` returned.
    pub unsafe fn on_co_create_instance(
        &self,
        riid: Option<&Guid>,
        ppv: *mut *mut c_void,
        original: impl FnOnce() -> Hresult,
    ) -> Hresult {
        let ret = original();
        let tracked = riid.is_some_and(|iid| {
            *iid == IID_INAMESPACE_TREE_CONTROL || *iid == IID_INAMESPACE_TREE_CONTROL2
        });
        if succeeded(ret) && tracked && !ppv.is_null() {
            let control = unsafe { *ppv };
            trace!("new tree control {control:?}");
            self.relay().notify_new_tree_control(control);
        }
        ret
    }

    /// `RegisterDragDrop`: the controller may substitute the drop target.
    pub fn on_register_drag_drop(
        &self,
        hwnd: Hwnd,
        drop_target: *mut c_void,
        original: impl FnOnce(*mut c_void) -> Hresult,
    ) -> Hresult {
        let mut drop_target = drop_target;
        self.relay().register_drag_drop(hwnd, &mut drop_target);
        original(drop_target)
    }

    /// `SHCreateShellFolderView`: hooks the view callback and, for a DefView,
    /// `CreateViewWindow3`, then retires.
    ///
    /// # Safety
    ///
    /// `create` must be null or a valid `SFV_CREATE`; `ppsv` must be null or
    /// valid for reads once `original` returned.
    pub unsafe fn on_create_shell_folder_view(
        &self,
        create: *const SfvCreate,
        ppsv: *mut *mut c_void,
        original: impl FnOnce() -> Hresult,
    ) -> Hresult {
        let callback = unsafe { create.as_ref() }
            .and_then(|create| unsafe { ForeignRef::from_raw(create.psfvcb) });
        if let Some(callback) = callback {
            if self.view_message.claim() {
                let slot = self.config.slots.view_callback_message;
                let ret = callback
                    .slot(slot)
                    .and_then(|target| self.hook(HookId::ViewMessageFilter, target));
                if let Err(e) = &ret {
                    warn!("view callback hook failed: {e}");
                }
                self.view_message.finish(ret.is_ok());
            }
        }

        let ret = original();

        let view = if succeeded(ret) && !ppsv.is_null() {
            unsafe { ForeignRef::from_raw(*ppsv) }
        } else {
            None
        };
        if let Some(view) = view {
            if view.query(&IID_CDEFVIEW).is_some() && self.view_window.claim() {
                let installed = match view.query(&IID_ISHELL_VIEW3) {
                    Some(view3) => {
                        let slot = self.config.slots.create_view_window3;
                        let ret = view3
                            .get()
                            .slot(slot)
                            .and_then(|target| self.hook(HookId::HeaderPolicyFilter, target));
                        if let Err(e) = &ret {
                            warn!("CreateViewWindow3 hook failed: {e}");
                        }
                        ret.is_ok()
                    }
                    None => {
                        debug!("DefView without IShellView3");
                        false
                    }
                };
                self.view_window.finish(installed);
            }
        }

        if self.view_message.is_settled() && self.view_window.is_settled() {
            self.retire(HookId::ViewCallbackBootstrap);
        }
        ret
    }

    /// `IShellView3::CreateViewWindow3`: applies the header-in-all-views
    /// policy of the owning window.
    ///
    /// # Safety
    ///
    /// `owner` must be null or a live `IShellBrowser`.
    pub unsafe fn on_create_view_window3(
        &self,
        owner: *mut c_void,
        mask: u32,
        flags: u32,
        original: impl FnOnce(u32, u32) -> Hresult,
    ) -> Hresult {
        let mut mask = FolderFlags::from_bits_retain(mask);
        let mut flags = FolderFlags::from_bits_retain(flags);
        let relay = self.relay();
        let owner_window = unsafe { ForeignRef::from_raw(owner) }
            .and_then(|owner| owner.window())
            .map(|hwnd| relay.owner_window(hwnd));
        if owner_window.is_some_and(|hwnd| relay.header_in_all_views(hwnd)) {
            mask |= FolderFlags::NO_HEADER_IN_ALL_VIEWS;
            flags -= FolderFlags::NO_HEADER_IN_ALL_VIEWS;
        }
        original(mask.bits(), flags.bits())
    }

    /// `IShellFolderViewCB::MessageSFVCB`
    pub fn on_view_callback_message(
        &self,
        msg: u32,
        wparam: usize,
        original: impl FnOnce() -> Hresult,
    ) -> Hresult {
        if msg == SFVM_LISTREFRESHED && wparam != 0 {
            self.relay().notify_list_refreshed();
        }
        original()
    }

    /// `IShellBrowser::BrowseObject`: the controller may veto the navigation.
    ///
    /// # Safety
    ///
    /// `browser` must be null or a live `IShellBrowser`.
    pub unsafe fn on_browse_object(
        &self,
        browser: *mut c_void,
        pidl: *const c_void,
        flags: u32,
        original: impl FnOnce(u32) -> Hresult,
    ) -> Hresult {
        let mut flags = flags;
        let relay = self.relay();
        let vetoed = unsafe { ForeignRef::from_raw(browser) }
            .and_then(|browser| browser.window())
            .is_some_and(|hwnd| relay.browse_object(relay.owner_window(hwnd), &mut flags, pidl));
        if vetoed {
            trace!("navigation vetoed");
            return S_FALSE;
        }
        original(flags)
    }

    /// `UiaReturnRawElementProvider`: hooks `QueryInterface` of the first
    /// items view provider, then retires.
    ///
    /// # Safety
    ///
    /// `element` must be null or a live element provider.
    pub unsafe fn on_return_raw_element_provider(
        &self,
        hwnd: Hwnd,
        lparam: isize,
        element: *mut c_void,
        original: impl FnOnce() -> isize,
    ) -> isize {
        // the object id travels in the low dword
        let client = lparam as i32 == OBJID_CLIENT;
        if self.element_query.is_idle() && client {
            let element = unsafe { ForeignRef::from_raw(element) };
            if let Some(element) = element {
                if self.relay().is_items_view(hwnd) && self.element_query.claim() {
                    let slot = self.config.slots.element_query_interface;
                    let ret = element
                        .slot(slot)
                        .and_then(|target| self.hook(HookId::AccessibilityQueryFilter, target));
                    if let Err(e) = &ret {
                        warn!("element provider hook failed: {e}");
                    }
                    self.element_query.finish(ret.is_ok());
                }
            }
        }

        let ret = original();
        if self.element_query.is_settled() {
            self.retire(HookId::AccessibilityBootstrap);
        }
        ret
    }

    /// `QueryInterface` of the items view provider: refuses the advise events
    /// interface.
    ///
    /// # Safety
    ///
    /// `ppv` must be null or valid for writes.
    pub unsafe fn on_element_query_interface(
        &self,
        riid: Option<&Guid>,
        ppv: *mut *mut c_void,
        original: impl FnOnce() -> Hresult,
    ) -> Hresult {
        if riid.is_some_and(|iid| *iid == IID_IRAW_ELEMENT_PROVIDER_ADVISE_EVENTS) {
            if !ppv.is_null() {
                unsafe { *ppv = ptr::null_mut() };
            }
            return E_NOINTERFACE;
        }
        original()
    }

    /// `ITravelLogEx::TravelToEntry`: lets the controller handle the travel
    /// as a back navigation.
    ///
    /// # Safety
    ///
    /// `site` must be null or a live COM object.
    pub unsafe fn on_travel_to_entry(
        &self,
        site: *mut c_void,
        original: impl FnOnce() -> Hresult,
    ) -> Hresult {
        let relay = self.relay();
        let browser = unsafe { ForeignRef::from_raw(site) }
            .and_then(|site| site.query(&IID_ISHELL_BROWSER));
        let handled = browser
            .as_ref()
            .and_then(|browser| browser.get().window())
            .is_some_and(|hwnd| {
                let mut flags = (BrowseFlags::NAVIGATE_BACK | BrowseFlags::SAME_BROWSER).bits();
                relay.browse_object(relay.owner_window(hwnd), &mut flags, ptr::null())
            });
        drop(browser);
        if handled {
            trace!("travel handled by the controller");
            return S_OK;
        }
        original()
    }
}
