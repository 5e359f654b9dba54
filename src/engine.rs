use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::HookError;

/// The machinery that actually rewrites code.
///
/// A backend turns a `(target, detour)` pair into a [`PatchSite`]. The site is
/// created disabled; the engine decides when calls start flowing through the
/// detour.
pub trait PatchBackend: Send + Sync {
    /// The per-target handle produced by [`PatchBackend::create`].
    type Site: PatchSite;

    /// Called once by [`Engine::start`].
    fn startup(&self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once by [`Engine::shutdown`], after every site has been dropped.
    fn shutdown(&self) {}

    /// Prepares an interception of `target` routed through `detour`.
    ///
    /// # Safety
    ///
    /// `target` must be the entry of a function and `detour` must be a
    /// function with exactly the same signature and calling convention.
    unsafe fn create(&self, target: usize, detour: usize) -> Result<Self::Site, HookError>;
}

/// One prepared interception.
///
/// Dropping a site must leave the target running its original code.
pub trait PatchSite: Send + Sync {
    /// Address that runs the original behaviour of the target.
    fn original(&self) -> usize;
    /// Routes future calls of the target through the detour.
    fn enable(&self) -> Result<(), HookError>;
    /// Routes future calls of the target to its original code again.
    fn disable(&self) -> Result<(), HookError>;
}

struct InterceptionRecord<S> {
    site: S,
    enabled: bool,
}

/// Owns every interception installed in the process.
///
/// The record table is only touched while installing, toggling or tearing
/// down; intercepted calls never look at it.
pub struct Engine<B: PatchBackend> {
    backend: B,
    started: AtomicBool,
    records: Mutex<HashMap<usize, InterceptionRecord<B::Site>>>,
}

impl<B: PatchBackend> Engine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            started: AtomicBool::new(false),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Starts the patching subsystem. Must run once before any install.
    pub fn start(&self) -> Result<(), HookError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HookError::Subsystem("already started"));
        }
        self.backend.startup().inspect_err(|_| {
            self.started.store(false, Ordering::Release);
        })
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Creates a disabled interception of `target` and returns the address of
    /// its original behaviour.
    ///
    /// # Safety
    ///
    /// See [`PatchBackend::create`].
    pub unsafe fn install(&self, target: usize, detour: usize) -> Result<usize, HookError> {
        if !self.is_started() {
            return Err(HookError::NotStarted);
        }
        if target == 0 {
            return Err(HookError::InvalidTarget(target));
        }
        let mut records = self.records.lock();
        if records.contains_key(&target) {
            return Err(HookError::AlreadyIntercepted(target));
        }
        let site = unsafe { self.backend.create(target, detour) }?;
        let original = site.original();
        debug!("interception created: target={target:#x} detour={detour:#x} original={original:#x}");
        records.insert(
            target,
            InterceptionRecord {
                site,
                enabled: false,
            },
        );
        Ok(original)
    }

    /// [`Engine::install`] followed by [`Engine::enable`]. The record is
    /// removed again if it can't be enabled.
    ///
    /// # Safety
    ///
    /// See [`PatchBackend::create`].
    pub unsafe fn install_enabled(&self, target: usize, detour: usize) -> Result<usize, HookError> {
        let original = unsafe { self.install(target, detour) }?;
        if let Err(e) = self.enable(target) {
            let _ = self.remove(target);
            return Err(e);
        }
        Ok(original)
    }

    pub fn enable(&self, target: usize) -> Result<(), HookError> {
        self.set_enabled(target, true)
    }

    /// Stops routing future calls through the detour. Calls already inside
    /// the detour run to completion.
    pub fn disable(&self, target: usize) -> Result<(), HookError> {
        self.set_enabled(target, false)
    }

    fn set_enabled(&self, target: usize, enabled: bool) -> Result<(), HookError> {
        if !self.is_started() {
            return Err(HookError::NotStarted);
        }
        let mut records = self.records.lock();
        let record = records
            .get_mut(&target)
            .ok_or(HookError::NotIntercepted(target))?;
        if record.enabled == enabled {
            return Ok(());
        }
        if enabled {
            record.site.enable()?;
        } else {
            record.site.disable()?;
        }
        record.enabled = enabled;
        debug!("interception at {target:#x} enabled={enabled}");
        Ok(())
    }

    /// Disables and forgets the interception of `target`.
    pub fn remove(&self, target: usize) -> Result<(), HookError> {
        let record = self
            .records
            .lock()
            .remove(&target)
            .ok_or(HookError::NotIntercepted(target))?;
        if record.enabled {
            record.site.disable()?;
        }
        Ok(())
    }

    pub fn is_enabled(&self, target: usize) -> bool {
        self.records.lock().get(&target).is_some_and(|r| r.enabled)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disables and removes every record and stops the subsystem. Safe to call
    /// any number of times, including when nothing was ever started.
    pub fn shutdown(&self) {
        let records: Vec<_> = self.records.lock().drain().collect();
        for (target, record) in records {
            if record.enabled {
                if let Err(e) = record.site.disable() {
                    warn!("failed to disable interception at {target:#x}: {e}");
                }
            }
        }
        if self.started.swap(false, Ordering::AcqRel) {
            self.backend.shutdown();
        }
    }
}

impl<B: PatchBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn install_requires_start() {
        let engine = Engine::new(FakeBackend::default());
        assert!(matches!(
            unsafe { engine.install(0x1000, 0x2000) },
            Err(HookError::NotStarted)
        ));
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(HookError::Subsystem(_))));
        assert_eq!(
            unsafe { engine.install(0x1000, 0x2000) }.unwrap(),
            0x1000 + crate::testing::TRAMPOLINE_DISTANCE
        );
    }

    #[test]
    fn one_record_per_target() {
        let engine = Engine::new(FakeBackend::default());
        engine.start().unwrap();
        unsafe { engine.install(0x1000, 0x2000) }.unwrap();
        assert!(matches!(
            unsafe { engine.install(0x1000, 0x3000) },
            Err(HookError::AlreadyIntercepted(0x1000))
        ));
        assert!(matches!(
            unsafe { engine.install(0, 0x3000) },
            Err(HookError::InvalidTarget(0))
        ));
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.backend().created(), 1);
    }

    #[test]
    fn records_start_disabled_and_toggle() {
        let engine = Engine::new(FakeBackend::default());
        engine.start().unwrap();
        unsafe { engine.install(0x1000, 0x2000) }.unwrap();
        assert!(!engine.is_enabled(0x1000));
        engine.enable(0x1000).unwrap();
        assert!(engine.is_enabled(0x1000));
        assert!(engine.backend().is_live(0x1000));
        engine.disable(0x1000).unwrap();
        engine.disable(0x1000).unwrap();
        assert!(!engine.backend().is_live(0x1000));
        assert!(matches!(
            engine.enable(0x5000),
            Err(HookError::NotIntercepted(0x5000))
        ));
    }

    #[test]
    fn remove_disables_first() {
        let engine = Engine::new(FakeBackend::default());
        engine.start().unwrap();
        unsafe { engine.install_enabled(0x1000, 0x2000) }.unwrap();
        engine.remove(0x1000).unwrap();
        assert!(!engine.backend().is_live(0x1000));
        assert!(engine.is_empty());
        assert!(matches!(
            engine.remove(0x1000),
            Err(HookError::NotIntercepted(0x1000))
        ));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let engine = Engine::new(FakeBackend::default());
        engine.shutdown();
        engine.shutdown();

        engine.start().unwrap();
        unsafe { engine.install_enabled(0x1000, 0x2000) }.unwrap();
        unsafe { engine.install_enabled(0x4000, 0x2000) }.unwrap();
        engine.shutdown();
        assert!(engine.is_empty());
        assert!(!engine.is_started());
        assert!(!engine.backend().is_live(0x1000));
        assert!(!engine.backend().is_live(0x4000));
        engine.shutdown();
        assert_eq!(engine.backend().shutdowns(), 1);
    }
}
