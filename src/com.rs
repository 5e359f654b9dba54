//! Borrowed and acquired references to host COM objects.
//!
//! Only the IUnknown and IOleWindow methods are called directly, always
//! through [`crate::vtable`], so a bad layout is reported instead of jumped
//! through.

use core::ffi::c_void;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use bitflags::bitflags;
use tracing::warn;
use uguid::{Guid, guid};

use crate::HookError;
use crate::host::Hwnd;
use crate::vtable;

pub type Hresult = i32;

pub const S_OK: Hresult = 0;
pub const S_FALSE: Hresult = 1;
pub const E_NOINTERFACE: Hresult = 0x8000_4002_u32 as i32;
pub const E_UNEXPECTED: Hresult = 0x8000_FFFF_u32 as i32;
pub const E_FAIL: Hresult = 0x8000_4005_u32 as i32;

pub fn succeeded(hr: Hresult) -> bool {
    hr >= 0
}

pub const IID_INAMESPACE_TREE_CONTROL: Guid = guid!("028212a3-b627-47e9-8856-c14265554e4f");
pub const IID_INAMESPACE_TREE_CONTROL2: Guid = guid!("7cc7aed8-290e-49bc-8945-c1401cc9306c");
pub const IID_ISHELL_BROWSER: Guid = guid!("000214e2-0000-0000-c000-000000000046");
pub const IID_ISHELL_BROWSER_SERVICE: Guid = guid!("dfbc7e30-f9e5-455f-88f8-fa98c1e494ca");
pub const IID_ITRAVEL_LOG_EX: Guid = guid!("3050f679-98b5-11cf-bb82-00aa00bdce0b");
pub const IID_ISHELL_VIEW3: Guid = guid!("ec39fa88-f8af-41c5-8421-38bed28f4673");
pub const IID_CDEFVIEW: Guid = guid!("4434ff80-ef4c-11ce-ae65-08002b2e1262");
pub const IID_IRAW_ELEMENT_PROVIDER_ADVISE_EVENTS: Guid =
    guid!("a407b27b-0f6d-4427-9292-473c7bf93258");

/// `SFVM_LISTREFRESHED`, sent to the view callback after a refresh.
pub const SFVM_LISTREFRESHED: u32 = 0x11;
/// `OBJID_CLIENT`
pub const OBJID_CLIENT: i32 = -4;

bitflags! {
    /// `FOLDERFLAGS` bits touched by the header policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FolderFlags: u32 {
        const NO_HEADER_IN_ALL_VIEWS = 0x1000_0000;
        const _ = !0;
    }

    /// `SBSP_*` bits passed to `BrowseObject`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BrowseFlags: u32 {
        const SAME_BROWSER = 0x0001;
        const NAVIGATE_BACK = 0x4000;
        const _ = !0;
    }
}

/// `SFV_CREATE`
#[repr(C)]
#[derive(Debug)]
pub struct SfvCreate {
    pub cb_size: u32,
    pub pshf: *mut c_void,
    pub psv_outer: *mut c_void,
    pub psfvcb: *mut c_void,
}

const QUERY_INTERFACE: usize = 0;
const RELEASE: usize = 2;
const GET_WINDOW: usize = 3;

pub type QueryInterfaceFn =
    unsafe extern "system" fn(*mut c_void, *const Guid, *mut *mut c_void) -> Hresult;
pub type ReleaseFn = unsafe extern "system" fn(*mut c_void) -> u32;
pub type GetWindowFn = unsafe extern "system" fn(*mut c_void, *mut Hwnd) -> Hresult;
pub type GetTravelLogFn = unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> Hresult;

/// A host object we were handed but hold no reference on.
///
/// Valid for the duration of the intercepted call that produced it.
#[derive(Clone, Copy)]
pub struct ForeignRef<'a> {
    ptr: NonNull<c_void>,
    _call: PhantomData<&'a c_void>,
}

impl<'a> ForeignRef<'a> {
    /// # Safety
    ///
    /// `ptr` must be null or a live COM object for `'a`.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            _call: PhantomData,
        })
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    /// Address stored in vtable slot `index`.
    pub fn slot(&self, index: usize) -> Result<usize, HookError> {
        unsafe { vtable::resolve_slot(self.as_raw(), index) }
    }

    /// Typed method pointer from vtable slot `index`.
    ///
    /// # Safety
    ///
    /// `F` must match the signature of the method in that slot.
    pub unsafe fn method<F: Copy>(&self, index: usize) -> Result<F, HookError> {
        unsafe { vtable::method(self.as_raw(), index) }
    }

    /// `QueryInterface`; the returned reference is released when dropped.
    pub fn query(&self, iid: &Guid) -> Option<Acquired> {
        let qi = match unsafe { self.method::<QueryInterfaceFn>(QUERY_INTERFACE) } {
            Ok(qi) => qi,
            Err(e) => {
                warn!("QueryInterface unavailable: {e}");
                return None;
            }
        };
        let mut out = ptr::null_mut();
        let hr = unsafe { qi(self.as_raw(), iid, &mut out) };
        if !succeeded(hr) {
            return None;
        }
        unsafe { Acquired::from_raw(out) }
    }

    /// `IOleWindow::GetWindow`
    pub fn window(&self) -> Option<Hwnd> {
        let get_window = unsafe { self.method::<GetWindowFn>(GET_WINDOW) }.ok()?;
        let mut hwnd = ptr::null_mut();
        let hr = unsafe { get_window(self.as_raw(), &mut hwnd) };
        (succeeded(hr) && !hwnd.is_null()).then_some(hwnd)
    }
}

/// One reference we own on a host object.
pub struct Acquired {
    ptr: NonNull<c_void>,
}

impl Acquired {
    /// Takes over a reference the host already added for us.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live COM object with one reference owned by the
    /// caller.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    pub fn get(&self) -> ForeignRef<'_> {
        ForeignRef {
            ptr: self.ptr,
            _call: PhantomData,
        }
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        match unsafe { vtable::method::<ReleaseFn>(self.ptr.as_ptr(), RELEASE) } {
            Ok(release) => {
                unsafe { release(self.ptr.as_ptr()) };
            }
            Err(e) => warn!("leaking reference: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCom;

    #[test]
    fn query_acquires_and_drop_releases() {
        let view = FakeCom::new();
        let view3 = FakeCom::new();
        view.answers(IID_ISHELL_VIEW3, &view3);

        let r = unsafe { ForeignRef::from_raw(view.as_ptr()) }.unwrap();
        let acquired = r.query(&IID_ISHELL_VIEW3).unwrap();
        assert_eq!(acquired.get().as_raw(), view3.as_ptr());
        assert_eq!(view3.refs(), 2);
        drop(acquired);
        assert_eq!(view3.refs(), 1);

        assert!(r.query(&IID_CDEFVIEW).is_none());
        assert_eq!(view.refs(), 1);
    }

    #[test]
    fn window_of_object() {
        let obj = FakeCom::new();
        let r = unsafe { ForeignRef::from_raw(obj.as_ptr()) }.unwrap();
        assert_eq!(r.window(), None);
        obj.set_window(0x1234 as Hwnd);
        assert_eq!(r.window(), Some(0x1234 as Hwnd));
    }

    #[test]
    fn null_is_not_an_object() {
        assert!(unsafe { ForeignRef::from_raw(ptr::null_mut()) }.is_none());
        assert!(unsafe { Acquired::from_raw(ptr::null_mut()) }.is_none());
    }

    #[test]
    fn flag_values() {
        assert_eq!(
            (BrowseFlags::NAVIGATE_BACK | BrowseFlags::SAME_BROWSER).bits(),
            0x4001
        );
        let flags = FolderFlags::from_bits_retain(0x1000_0001) - FolderFlags::NO_HEADER_IN_ALL_VIEWS;
        assert_eq!(flags.bits(), 1);
        assert_eq!(E_NOINTERFACE as u32, 0x8000_4002);
    }
}
