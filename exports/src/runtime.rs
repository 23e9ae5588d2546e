pub use grapple_runtime::memory::MemoryError;
pub use grapple_runtime::memory::ProcessMemory;
pub use grapple_runtime::buffer::BufferedMemory;
pub use grapple_runtime::module::LoadedModule;
pub use grapple_runtime::module::ModuleError;

#[cfg(windows)]
pub use grapple_runtime::remote::RemoteProcess;
