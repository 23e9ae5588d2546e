pub mod memory;
pub mod buffer;
pub mod module;

#[cfg(windows)]
pub mod remote;

pub use memory::{MemoryError, ProcessMemory};
pub use buffer::BufferedMemory;
pub use module::{LoadedModule, ModuleError};

#[cfg(windows)]
pub use remote::RemoteProcess;
