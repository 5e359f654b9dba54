//! Stand-ins for the patcher, the host and host COM objects.

use core::ffi::{CStr, c_void};
use core::ptr;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use uguid::Guid;

use crate::HookError;
use crate::com::{E_FAIL, E_NOINTERFACE, Hresult, S_OK};
use crate::engine::{PatchBackend, PatchSite};
use crate::host::{Host, Hwnd, ModuleHandle};
use crate::registry::{DetourTable, HookId};

type EnableHook = Box<dyn Fn(usize) + Send + Sync>;

/// Offset of a fake trampoline from its target.
pub const TRAMPOLINE_DISTANCE: usize = 0x10_0000;

/// Backend that patches nothing. The original of a site sits
/// [`TRAMPOLINE_DISTANCE`] above its target.
#[derive(Default)]
pub struct FakeBackend {
    created: AtomicUsize,
    shutdowns: AtomicUsize,
    live: Arc<Mutex<HashSet<usize>>>,
    refused: Mutex<HashSet<usize>>,
    stuck: Arc<Mutex<HashSet<usize>>>,
    on_enable: Arc<Mutex<Option<EnableHook>>>,
}

impl FakeBackend {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Whether calls of `target` currently reach the detour.
    pub fn is_live(&self, target: usize) -> bool {
        self.live.lock().contains(&target)
    }

    /// Makes `create` fail for `target`.
    pub fn refuse(&self, target: usize) {
        self.refused.lock().insert(target);
    }

    /// Makes `enable` fail for `target`.
    pub fn refuse_enable(&self, target: usize) {
        self.stuck.lock().insert(target);
    }

    /// Runs `f` with the target at the moment a site goes live, as the first
    /// host call through the detour would.
    pub fn on_enable(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_enable.lock() = Some(Box::new(f));
    }
}

pub struct FakeSite {
    target: usize,
    live: Arc<Mutex<HashSet<usize>>>,
    stuck: Arc<Mutex<HashSet<usize>>>,
    on_enable: Arc<Mutex<Option<EnableHook>>>,
}

impl PatchBackend for FakeBackend {
    type Site = FakeSite;

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn create(&self, target: usize, _detour: usize) -> Result<FakeSite, HookError> {
        if self.refused.lock().contains(&target) {
            return Err(HookError::InvalidTarget(target));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSite {
            target,
            live: self.live.clone(),
            stuck: self.stuck.clone(),
            on_enable: self.on_enable.clone(),
        })
    }
}

impl PatchSite for FakeSite {
    fn original(&self) -> usize {
        self.target + TRAMPOLINE_DISTANCE
    }

    fn enable(&self) -> Result<(), HookError> {
        if self.stuck.lock().contains(&self.target) {
            return Err(HookError::MemoryProtect(5));
        }
        self.live.lock().insert(self.target);
        if let Some(f) = &*self.on_enable.lock() {
            f(self.target);
        }
        Ok(())
    }

    fn disable(&self) -> Result<(), HookError> {
        self.live.lock().remove(&self.target);
        Ok(())
    }
}

impl Drop for FakeSite {
    fn drop(&mut self) {
        self.live.lock().remove(&self.target);
    }
}

/// One detour address per interceptor, never called.
pub fn detours() -> DetourTable {
    HookId::ALL
        .iter()
        .enumerate()
        .fold(DetourTable::empty(), |table, (i, id)| {
            table.with(*id, 0xd000_0000 + i * 0x10)
        })
}

/// A delivered signal, as the fake host saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub hwnd: usize,
    pub signal: String,
    pub wparam: usize,
    pub lparam: isize,
}

type Responder = Box<dyn Fn(&Delivered) -> isize + Send + Sync>;

const FIRST_MESSAGE: u32 = 0xc000;

/// Host with in-memory windows, messages and modules.
#[derive(Default)]
pub struct FakeHost {
    names: Mutex<Vec<String>>,
    registrations: AtomicUsize,
    sent: Mutex<Vec<Delivered>>,
    posted: Mutex<Vec<Delivered>>,
    responder: Mutex<Option<Responder>>,
    parents: Mutex<HashMap<usize, usize>>,
    modules: Mutex<HashMap<String, HashMap<String, usize>>>,
    loaded: AtomicUsize,
    released: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// `new` plus the three mandatory exports, at 0x1000, 0x2000 and 0x3000.
    pub fn with_shell() -> Self {
        let host = Self::new();
        host.add_export("ole32.dll", "CoCreateInstance", 0x1000);
        host.add_export("ole32.dll", "RegisterDragDrop", 0x2000);
        host.add_export("shell32.dll", "SHCreateShellFolderView", 0x3000);
        host
    }

    pub fn add_export(&self, module: &str, name: &str, address: usize) {
        self.modules
            .lock()
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), address);
    }

    pub fn respond(&self, f: impl Fn(&Delivered) -> isize + Send + Sync + 'static) {
        *self.responder.lock() = Some(Box::new(f));
    }

    pub fn set_parent(&self, child: Hwnd, parent: Hwnd) {
        self.parents.lock().insert(child as usize, parent as usize);
    }

    pub fn message_name(&self, id: u32) -> Option<String> {
        let index = id.checked_sub(FIRST_MESSAGE)? as usize;
        self.names.lock().get(index).cloned()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Delivered> {
        self.sent.lock().clone()
    }

    pub fn posted(&self) -> Vec<Delivered> {
        self.posted.lock().clone()
    }

    pub fn sent_named(&self, suffix: &str) -> Vec<Delivered> {
        self.sent()
            .into_iter()
            .filter(|d| d.signal.ends_with(suffix))
            .collect()
    }

    pub fn posted_named(&self, suffix: &str) -> Vec<Delivered> {
        self.posted()
            .into_iter()
            .filter(|d| d.signal.ends_with(suffix))
            .collect()
    }

    /// Modules loaded and not yet released.
    pub fn modules_held(&self) -> usize {
        self.loaded.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }

    fn delivered(&self, hwnd: Hwnd, msg: u32, wparam: usize, lparam: isize) -> Delivered {
        Delivered {
            hwnd: hwnd as usize,
            signal: self.message_name(msg).unwrap_or_default(),
            wparam,
            lparam,
        }
    }
}

impl Host for FakeHost {
    fn register_message(&self, name: &CStr) -> u32 {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let name = name.to_string_lossy().into_owned();
        let mut names = self.names.lock();
        let index = match names.iter().position(|n| *n == name) {
            Some(index) => index,
            None => {
                names.push(name);
                names.len() - 1
            }
        };
        FIRST_MESSAGE + index as u32
    }

    fn send_message(&self, hwnd: Hwnd, msg: u32, wparam: usize, lparam: isize) -> isize {
        if hwnd.is_null() {
            return 0;
        }
        let delivered = self.delivered(hwnd, msg, wparam, lparam);
        self.sent.lock().push(delivered.clone());
        self.responder.lock().as_ref().map_or(0, |f| f(&delivered))
    }

    fn post_thread_message(&self, msg: u32, wparam: usize, lparam: isize) -> bool {
        let delivered = self.delivered(ptr::null_mut(), msg, wparam, lparam);
        self.posted.lock().push(delivered);
        true
    }

    fn parent_window(&self, hwnd: Hwnd) -> Option<Hwnd> {
        self.parents
            .lock()
            .get(&(hwnd as usize))
            .map(|parent| *parent as Hwnd)
    }

    fn load_module(&self, name: &CStr) -> Result<ModuleHandle, HookError> {
        let name = name.to_string_lossy().into_owned();
        let modules = self.modules.lock();
        let mut names: Vec<_> = modules.keys().collect();
        names.sort();
        let index = names
            .iter()
            .position(|n| **n == name)
            .ok_or(HookError::ModuleNotFound(name))?;
        self.loaded.fetch_add(1, Ordering::SeqCst);
        Ok(ModuleHandle(index + 1))
    }

    fn export_address(&self, module: &ModuleHandle, name: &CStr) -> Result<usize, HookError> {
        let name = name.to_string_lossy().into_owned();
        let modules = self.modules.lock();
        let mut names: Vec<_> = modules.keys().collect();
        names.sort();
        names
            .get(module.0 - 1)
            .and_then(|m| modules[*m].get(&name))
            .copied()
            .ok_or(HookError::ExportNotFound(name))
    }

    fn release_module(&self, _module: ModuleHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

const VTABLE_LEN: usize = 24;

static NEXT_FAKE_CODE: AtomicUsize = AtomicUsize::new(0x7000_0000);

/// A COM object with a working IUnknown and IOleWindow, answering a fixed set
/// of interfaces.
///
/// Slot 4 is `IShellBrowserService::GetTravelLog`. Every slot from 5 on holds
/// an address unique to the object, so it can be used as a hook target.
#[repr(C)]
pub struct FakeCom {
    vtbl: *const AtomicUsize,
    slots: Box<[AtomicUsize; VTABLE_LEN]>,
    refs: AtomicI32,
    window: AtomicUsize,
    travel_log: AtomicUsize,
    interfaces: Mutex<Vec<(Guid, usize)>>,
}

// Only touched through the atomics and the mutex above.
unsafe impl Send for FakeCom {}
unsafe impl Sync for FakeCom {}

impl FakeCom {
    pub fn new() -> Box<Self> {
        let base = NEXT_FAKE_CODE.fetch_add(0x1000, Ordering::SeqCst);
        let slots: Box<[AtomicUsize; VTABLE_LEN]> =
            Box::new(std::array::from_fn(|i| AtomicUsize::new(base + i * 0x10)));
        slots[0].store(fake_query_interface as usize, Ordering::SeqCst);
        slots[1].store(fake_add_ref as usize, Ordering::SeqCst);
        slots[2].store(fake_release as usize, Ordering::SeqCst);
        slots[3].store(fake_get_window as usize, Ordering::SeqCst);
        slots[4].store(fake_get_travel_log as usize, Ordering::SeqCst);
        let vtbl = slots.as_ptr();
        Box::new(Self {
            vtbl,
            slots,
            refs: AtomicI32::new(1),
            window: AtomicUsize::new(0),
            travel_log: AtomicUsize::new(0),
            interfaces: Mutex::new(Vec::new()),
        })
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self as *const Self as *mut c_void
    }

    pub fn slot(&self, index: usize) -> usize {
        self.slots[index].load(Ordering::SeqCst)
    }

    pub fn set_slot(&self, index: usize, value: usize) {
        self.slots[index].store(value, Ordering::SeqCst);
    }

    /// `QueryInterface(iid)` hands out `target`.
    pub fn answers(&self, iid: Guid, target: &FakeCom) {
        self.interfaces.lock().push((iid, target.as_ptr() as usize));
    }

    pub fn set_window(&self, hwnd: Hwnd) {
        self.window.store(hwnd as usize, Ordering::SeqCst);
    }

    pub fn set_travel_log(&self, travel_log: &FakeCom) {
        self.travel_log
            .store(travel_log.as_ptr() as usize, Ordering::SeqCst);
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

unsafe fn fake<'a>(this: *mut c_void) -> &'a FakeCom {
    unsafe { &*(this as *const FakeCom) }
}

unsafe extern "system" fn fake_query_interface(
    this: *mut c_void,
    riid: *const Guid,
    ppv: *mut *mut c_void,
) -> Hresult {
    let obj = unsafe { fake(this) };
    let iid = unsafe { *riid };
    let found = obj
        .interfaces
        .lock()
        .iter()
        .find(|(g, _)| *g == iid)
        .map(|(_, p)| *p);
    match found {
        Some(p) => {
            unsafe { fake(p as *mut c_void) }
                .refs
                .fetch_add(1, Ordering::SeqCst);
            unsafe { *ppv = p as *mut c_void };
            S_OK
        }
        None => {
            unsafe { *ppv = ptr::null_mut() };
            E_NOINTERFACE
        }
    }
}

unsafe extern "system" fn fake_add_ref(this: *mut c_void) -> u32 {
    (unsafe { fake(this) }.refs.fetch_add(1, Ordering::SeqCst) + 1) as u32
}

unsafe extern "system" fn fake_release(this: *mut c_void) -> u32 {
    (unsafe { fake(this) }.refs.fetch_sub(1, Ordering::SeqCst) - 1) as u32
}

unsafe extern "system" fn fake_get_window(this: *mut c_void, phwnd: *mut Hwnd) -> Hresult {
    let hwnd = unsafe { fake(this) }.window.load(Ordering::SeqCst);
    unsafe { *phwnd = hwnd as Hwnd };
    if hwnd == 0 { E_FAIL } else { S_OK }
}

unsafe extern "system" fn fake_get_travel_log(this: *mut c_void, out: *mut *mut c_void) -> Hresult {
    let travel_log = unsafe { fake(this) }.travel_log.load(Ordering::SeqCst);
    if travel_log == 0 {
        unsafe { *out = ptr::null_mut() };
        return E_FAIL;
    }
    unsafe { fake(travel_log as *mut c_void) }
        .refs
        .fetch_add(1, Ordering::SeqCst);
    unsafe { *out = travel_log as *mut c_void };
    S_OK
}
