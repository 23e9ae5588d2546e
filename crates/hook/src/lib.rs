pub mod error;
pub mod patch;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod trampoline;
pub mod instrumentor;

pub use error::HookError;
pub use patch::{HookStatus, InstalledHook, PatchRequest};
pub use process::{AttachedProcess, ProcessId};
pub use registry::{HookHandle, HookRegistry};
pub use resolver::{SymbolResolver, SymbolSource};
pub use trampoline::DispatchEntry;
pub use instrumentor::Instrumentor;
