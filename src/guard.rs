use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

/// Outcome of [`OnceGuard::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// First caller ever; runs the guarded sequence.
    Winner,
    /// Somebody else already won; return immediately.
    Loser,
}

/// Lets exactly one caller through, process wide, without blocking the others.
///
/// The counter only ever moves 0 -> 1 and is never written by a loser, so a
/// second winner can't appear no matter how callers interleave.
pub struct OnceGuard(AtomicU32);

impl OnceGuard {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn enter(&self) -> Entry {
        match self
            .0
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Entry::Winner,
            Err(_) => Entry::Loser,
        }
    }

    pub fn is_entered(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

impl Default for OnceGuard {
    fn default() -> Self {
        Self::new()
    }
}

const IDLE: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;
const FAILED: u8 = 3;

/// Tracks the one further hook a bootstrap interceptor is responsible for.
///
/// `Idle -> Installing -> Installed | Failed`. Only the caller that moved the
/// flag out of `Idle` may install.
pub struct BootstrapFlag(AtomicU8);

impl BootstrapFlag {
    pub const fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    /// Claims the install. `false` if another call already claimed it.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(IDLE, INSTALLING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self, installed: bool) {
        self.0
            .store(if installed { INSTALLED } else { FAILED }, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.0.load(Ordering::Acquire) == IDLE
    }

    pub fn is_installed(&self) -> bool {
        self.0.load(Ordering::Acquire) == INSTALLED
    }

    /// Installed or given up on.
    pub fn is_settled(&self) -> bool {
        matches!(self.0.load(Ordering::Acquire), INSTALLED | FAILED)
    }
}

impl Default for BootstrapFlag {
    fn default() -> Self {
        Self::new()
    }
}
