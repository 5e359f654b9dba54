use core::ffi::{CStr, c_void};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::HookError;
use crate::com::{
    Acquired, ForeignRef, GetTravelLogFn, IID_ISHELL_BROWSER_SERVICE, IID_ITRAVEL_LOG_EX, succeeded,
};
use crate::config::HookConfig;
use crate::engine::{Engine, PatchBackend};
use crate::guard::{BootstrapFlag, Entry, OnceGuard};
use crate::host::{Host, ModuleHandle};
use crate::relay::{EventRelay, SignalCatalog};

/// The interceptors, one installed interception each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookId {
    /// `CoCreateInstance`
    ObjectCreationFilter,
    /// `RegisterDragDrop`
    DragDropRegistration,
    /// `SHCreateShellFolderView`
    ViewCallbackBootstrap,
    /// `IShellView3::CreateViewWindow3`
    HeaderPolicyFilter,
    /// `IShellFolderViewCB::MessageSFVCB`
    ViewMessageFilter,
    /// `IShellBrowser::BrowseObject`
    NavigationVeto,
    /// `UiaReturnRawElementProvider`
    AccessibilityBootstrap,
    /// `QueryInterface` of the items view element provider
    AccessibilityQueryFilter,
    /// `ITravelLogEx::TravelToEntry`
    TravelEntryOverride,
}

impl HookId {
    pub const COUNT: usize = 9;

    pub const ALL: [HookId; HookId::COUNT] = [
        HookId::ObjectCreationFilter,
        HookId::DragDropRegistration,
        HookId::ViewCallbackBootstrap,
        HookId::HeaderPolicyFilter,
        HookId::ViewMessageFilter,
        HookId::NavigationVeto,
        HookId::AccessibilityBootstrap,
        HookId::AccessibilityQueryFilter,
        HookId::TravelEntryOverride,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Detour address of every interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetourTable([usize; HookId::COUNT]);

impl DetourTable {
    pub const fn empty() -> Self {
        Self([0; HookId::COUNT])
    }

    pub fn with(mut self, id: HookId, detour: usize) -> Self {
        self.0[id.index()] = detour;
        self
    }

    pub fn get(&self, id: HookId) -> usize {
        self.0[id.index()]
    }
}

#[derive(Default)]
struct HookSlot {
    target: AtomicUsize,
    original: AtomicUsize,
}

/// Mandatory exports hooked by [`Registry::initialize`].
const MANDATORY: [(&CStr, &CStr, HookId); 3] = [
    (c"ole32.dll", c"CoCreateInstance", HookId::ObjectCreationFilter),
    (c"ole32.dll", c"RegisterDragDrop", HookId::DragDropRegistration),
    (c"shell32.dll", c"SHCreateShellFolderView", HookId::ViewCallbackBootstrap),
];

const AUTOMATION: (&CStr, &CStr) = (c"UIAutomationCore.dll", c"UiaReturnRawElementProvider");

/// All process-wide hook state.
///
/// Created once, before the first lifecycle call, and alive until the
/// process goes away. Detours reach it through the one global the native
/// entry points keep; everything else receives it by reference.
pub struct Registry<B: PatchBackend, H: Host> {
    pub(crate) config: HookConfig,
    pub(crate) host: H,
    pub(crate) engine: Engine<B>,
    detours: DetourTable,
    hooks: [HookSlot; HookId::COUNT],
    catalog: OnceLock<SignalCatalog>,
    init_guard: OnceGuard,
    browser_guard: OnceGuard,
    pub(crate) view_message: BootstrapFlag,
    pub(crate) view_window: BootstrapFlag,
    pub(crate) element_query: BootstrapFlag,
    modules: Mutex<Vec<ModuleHandle>>,
}

impl<B: PatchBackend, H: Host> Registry<B, H> {
    pub fn new(config: HookConfig, backend: B, host: H, detours: DetourTable) -> Self {
        Self {
            config,
            host,
            engine: Engine::new(backend),
            detours,
            hooks: Default::default(),
            catalog: OnceLock::new(),
            init_guard: OnceGuard::new(),
            browser_guard: OnceGuard::new(),
            view_message: BootstrapFlag::new(),
            view_window: BootstrapFlag::new(),
            element_query: BootstrapFlag::new(),
            modules: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn engine(&self) -> &Engine<B> {
        &self.engine
    }

    pub fn relay(&self) -> EventRelay<'_, H> {
        EventRelay::new(&self.host, self.catalog.get())
    }

    /// Address that runs the original behaviour behind `id`, once installed.
    pub fn original(&self, id: HookId) -> Option<usize> {
        match self.hooks[id.index()].original.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn target(&self, id: HookId) -> Option<usize> {
        match self.hooks[id.index()].target.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    /// The function a detour of `id` calls to run the host's behaviour, as an
    /// `F`.
    ///
    /// The trampoline while the interception exists. After [`Registry::dispose`]
    /// the target runs its own code again and is called directly. The target
    /// is published before the jump goes live, so a detour never sees `None`.
    ///
    /// # Safety
    ///
    /// `F` must be the function pointer type of the intercepted function.
    pub unsafe fn passthrough<F: Copy>(&self, id: HookId) -> Option<F> {
        let addr = self.original(id).or_else(|| self.target(id))?;
        Some(unsafe { core::mem::transmute_copy::<usize, F>(&addr) })
    }

    pub fn is_active(&self, id: HookId) -> bool {
        self.target(id).is_some_and(|t| self.engine.is_enabled(t))
    }

    /// Intercepts `target` with the detour of `id` and enables it.
    ///
    /// The original is published before the jump goes live: a host thread
    /// may enter the detour the moment it does.
    pub(crate) fn hook(&self, id: HookId, target: usize) -> Result<(), HookError> {
        let detour = self.detours.get(id);
        let original = unsafe { self.engine.install(target, detour) }?;
        let slot = &self.hooks[id.index()];
        slot.target.store(target, Ordering::Release);
        slot.original.store(original, Ordering::Release);
        if let Err(e) = self.engine.enable(target) {
            slot.original.store(0, Ordering::Release);
            slot.target.store(0, Ordering::Release);
            let _ = self.engine.remove(target);
            return Err(e);
        }
        debug!("{id:?} hooked at {target:#x}, original {original:#x}");
        Ok(())
    }

    /// Stops routing calls through the interceptor `id`.
    pub(crate) fn retire(&self, id: HookId) {
        let Some(target) = self.target(id) else {
            return;
        };
        if !self.engine.is_enabled(target) {
            return;
        }
        match self.engine.disable(target) {
            Ok(()) => debug!("{id:?} retired"),
            Err(e) => warn!("failed to retire {id:?}: {e}"),
        }
    }

    fn resolve_export(&self, module: &CStr, export: &CStr) -> Result<usize, HookError> {
        let handle = self.host.load_module(module)?;
        let address = self.host.export_address(&handle, export);
        self.modules.lock().push(handle);
        address
    }

    /// The `Initialize` entry point. Only the first call does anything.
    pub fn initialize(&self) -> Result<(), HookError> {
        if self.init_guard.enter() == Entry::Loser {
            debug!("already initialized");
            return Ok(());
        }
        let catalog = SignalCatalog::resolve(&self.host, &self.config.signal_prefix);
        let _ = self.catalog.set(catalog);

        self.engine.start().inspect_err(|e| error!("can't start patching: {e}"))?;
        for (module, export, id) in MANDATORY {
            self.resolve_export(module, export)
                .and_then(|target| self.hook(id, target))
                .inspect_err(|e| error!("can't hook {export:?}: {e}"))?;
        }

        let (module, export) = AUTOMATION;
        match self.resolve_export(module, export) {
            Ok(target) => {
                if let Err(e) = self.hook(HookId::AccessibilityBootstrap, target) {
                    warn!("accessibility hook skipped: {e}");
                }
            }
            Err(e) => info!("accessibility hook unavailable: {e}"),
        }
        info!("initialized, {} interceptions", self.engine.len());
        Ok(())
    }

    /// The `InitShellBrowserHook` entry point. Only the first call that gets
    /// as far as installing does anything.
    ///
    /// A null browser, a browser without `BrowseObject`, or a call before
    /// [`Registry::initialize`] fails without using up that call.
    ///
    /// # Safety
    ///
    /// `browser` must be null or a live `IShellBrowser`.
    pub unsafe fn init_shell_browser_hook(&self, browser: *mut c_void) -> Result<(), HookError> {
        let slots = self.config.slots;
        let Some(browser) = (unsafe { ForeignRef::from_raw(browser) }) else {
            return Err(HookError::LayoutMismatch {
                slot: slots.browse_object,
                reason: "null object",
            });
        };
        if !self.engine.is_started() {
            return Err(HookError::NotStarted);
        }
        let target = browser.slot(slots.browse_object)?;
        if self.browser_guard.enter() == Entry::Loser {
            debug!("shell browser already hooked");
            return Ok(());
        }

        self.hook(HookId::NavigationVeto, target)
            .inspect_err(|e| error!("can't hook BrowseObject: {e}"))?;

        match self.hook_travel_log(browser) {
            Ok(true) => {}
            Ok(false) => info!("travel log not reachable, TravelToEntry left alone"),
            Err(e) => warn!("TravelToEntry hook skipped: {e}"),
        }
        Ok(())
    }

    fn hook_travel_log(&self, browser: ForeignRef<'_>) -> Result<bool, HookError> {
        let slots = self.config.slots;
        let Some(service) = browser.query(&IID_ISHELL_BROWSER_SERVICE) else {
            return Ok(false);
        };
        let get_travel_log = unsafe { service.get().method::<GetTravelLogFn>(slots.get_travel_log) }?;
        let mut raw = core::ptr::null_mut();
        if !succeeded(unsafe { get_travel_log(service.get().as_raw(), &mut raw) }) {
            return Ok(false);
        }
        let Some(travel_log) = (unsafe { Acquired::from_raw(raw) }) else {
            return Ok(false);
        };
        let Some(travel_log_ex) = travel_log.get().query(&IID_ITRAVEL_LOG_EX) else {
            return Ok(false);
        };
        let target = travel_log_ex.get().slot(slots.travel_to_entry)?;
        self.hook(HookId::TravelEntryOverride, target)?;
        Ok(true)
    }

    /// The `Dispose` entry point: removes every interception and releases
    /// the modules loaded by [`Registry::initialize`]. Safe to repeat.
    ///
    /// Targets are kept so that a detour still running calls the restored
    /// target instead of a freed trampoline.
    pub fn dispose(&self) {
        self.engine.shutdown();
        for slot in &self.hooks {
            slot.original.store(0, Ordering::Release);
        }
        let modules: Vec<_> = self.modules.lock().drain(..).collect();
        for module in modules {
            self.host.release_module(module);
        }
        debug!("disposed");
    }
}
