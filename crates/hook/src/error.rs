use std::fmt;

use grapple_address::Address;
use grapple_runtime::MemoryError;

use crate::process::ProcessId;

#[derive(Debug)]
pub enum HookError {
    SymbolNotFound { module: String, symbol: String },
    HandlerModuleNotLoaded { module: String },
    PatchWidthInsufficient { address: Address, width: usize, required: usize },
    PatchSplitsInstruction { address: Address, width: usize },
    PatchRaceDetected { address: Address },
    OverlappingPatch { address: Address, existing: Address },
    TeardownRace { process: ProcessId },
    UnknownProcess(ProcessId),
    Memory(MemoryError),
    Assembly(String),
}

impl HookError {
    /// Failures that leave the process usable but without the hooked capability.
    pub fn is_install_failure(&self) -> bool {
        matches!(
            self,
            HookError::SymbolNotFound { .. }
                | HookError::HandlerModuleNotLoaded { .. }
                | HookError::PatchWidthInsufficient { .. }
                | HookError::PatchSplitsInstruction { .. }
        )
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::SymbolNotFound { module, symbol } => {
                write!(f, "could not resolve {}!{}", module, symbol)
            },
            HookError::HandlerModuleNotLoaded { module } => {
                write!(f, "handler module {} is not loaded", module)
            },
            HookError::PatchWidthInsufficient { address, width, required } => write!(
                f,
                "patch width {} at {} is too small, a redirect needs {} bytes",
                width, address, required,
            ),
            HookError::PatchSplitsInstruction { address, width } => {
                write!(f, "patching {} bytes at {} splits an instruction", width, address)
            },
            HookError::PatchRaceDetected { address } => {
                write!(f, "bytes at {} changed underneath the patcher", address)
            },
            HookError::OverlappingPatch { address, existing } => {
                write!(f, "patch at {} overlaps the hook at {}", address, existing)
            },
            HookError::TeardownRace { process } => {
                write!(f, "process {} has to be stopped before hooks are removed", process)
            },
            HookError::UnknownProcess(process) => write!(f, "process {} is not attached", process),
            HookError::Memory(e) => write!(f, "{}", e),
            HookError::Assembly(e) => write!(f, "could not assemble trampoline: {}", e),
        }
    }
}

impl std::error::Error for HookError {}

impl From<MemoryError> for HookError {
    fn from(value: MemoryError) -> Self {
        HookError::Memory(value)
    }
}

impl From<iced_x86::IcedError> for HookError {
    fn from(value: iced_x86::IcedError) -> Self {
        HookError::Assembly(value.to_string())
    }
}
