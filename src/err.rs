use std::io;
use thiserror::Error;

/// Hook errors.
#[derive(Error, Debug)]
pub enum HookError {
    /// The patching subsystem could not start, or was started twice
    #[error("patching subsystem error: {0}")]
    Subsystem(&'static str),

    /// The patching subsystem has not been started
    #[error("patching subsystem not started")]
    NotStarted,

    /// The address already has an interception record
    #[error("address {0:#x} is already intercepted")]
    AlreadyIntercepted(usize),

    /// The address has no interception record
    #[error("address {0:#x} is not intercepted")]
    NotIntercepted(usize),

    /// The address is null or not executable
    #[error("address {0:#x} is not a patchable function")]
    InvalidTarget(usize),

    /// The function returns before there is room for the jump
    #[error("function at {0:#x} is too short to patch")]
    FunctionTooShort(usize),

    /// The foreign object does not have the assumed virtual table layout
    #[error("layout mismatch at slot {slot}: {reason}")]
    LayoutMismatch {
        /// The slot that was being resolved
        slot: usize,
        /// What was wrong with it
        reason: &'static str,
    },

    /// A host module could not be loaded
    #[error("module {0} not found")]
    ModuleNotFound(String),

    /// A host module does not export the requested symbol
    #[error("export {0} not found")]
    ExportNotFound(String),

    /// Error occurs when modifying the memory protect
    #[error("memory protect error, code:{0}")]
    MemoryProtect(u32),

    /// Error occurs when allocating the trampoline page
    #[error("memory allocation error, code:{0}")]
    MemoryAllocation(u32),

    /// No free page was found near the target
    #[error("can't find a free page near the target")]
    MemorySearching,

    /// Can't disassemble in the specified address
    #[error("disassemble error")]
    Disassemble,

    /// The stolen instructions can't be moved to the trampoline
    #[error("can't move code")]
    MoveCode,

    /// The other threads could not be frozen around a code rewrite
    #[error("can't freeze threads, code:{0}")]
    ThreadFreeze(u32),

    /// Some io error
    #[error("io error")]
    Io(#[from] io::Error),
}

/// Status codes handed back across the exported entry points.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Unclassified failure
    Unknown = -1,
    /// Success
    Ok = 0,
    /// The patching subsystem was already started
    AlreadyInitialized = 1,
    /// The patching subsystem is not started
    NotInitialized = 2,
    /// The target already has a record
    AlreadyCreated = 3,
    /// The target has no record
    NotCreated = 4,
    /// The target is not executable
    NotExecutable = 7,
    /// The target can't be patched
    UnsupportedFunction = 8,
    /// Trampoline memory could not be allocated
    MemoryAlloc = 9,
    /// Memory protection could not be changed
    MemoryProtect = 10,
    /// A host module is missing
    ModuleNotFound = 11,
    /// A host export is missing
    FunctionNotFound = 12,
}

impl HookError {
    /// The status code reported to the loader for this error.
    pub fn status(&self) -> Status {
        match self {
            HookError::Subsystem(_) => Status::AlreadyInitialized,
            HookError::NotStarted => Status::NotInitialized,
            HookError::AlreadyIntercepted(_) => Status::AlreadyCreated,
            HookError::NotIntercepted(_) => Status::NotCreated,
            HookError::InvalidTarget(_) => Status::NotExecutable,
            HookError::FunctionTooShort(_)
            | HookError::LayoutMismatch { .. }
            | HookError::Disassemble
            | HookError::MoveCode => Status::UnsupportedFunction,
            HookError::MemoryAllocation(_) | HookError::MemorySearching => Status::MemoryAlloc,
            HookError::MemoryProtect(_) => Status::MemoryProtect,
            HookError::ModuleNotFound(_) => Status::ModuleNotFound,
            HookError::ExportNotFound(_) => Status::FunctionNotFound,
            HookError::ThreadFreeze(_) | HookError::Io(_) => Status::Unknown,
        }
    }
}

impl From<Result<(), HookError>> for Status {
    fn from(ret: Result<(), HookError>) -> Self {
        ret.map_or_else(|e| e.status(), |_| Status::Ok)
    }
}
