use std::fmt;

use grapple_address::{Address, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    ReadFailed { address: Address, length: usize },
    WriteFailed { address: Address, length: usize },
    ProtectFailed { address: Address, length: usize },
    AllocationFailed { size: usize },
    FreeFailed { address: Address },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::ReadFailed { address, length } => write!(f, "could not read {} bytes at {}", length, address),
            MemoryError::WriteFailed { address, length } => write!(f, "could not write {} bytes at {}", length, address),
            MemoryError::ProtectFailed { address, length } => {
                write!(f, "could not change protection of {} bytes at {}", length, address)
            },
            MemoryError::AllocationFailed { size } => write!(f, "could not allocate {} executable bytes", size),
            MemoryError::FreeFailed { address } => write!(f, "could not free allocation at {}", address),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Access to a target's address space, supplied by whoever attached to the process.
pub trait ProcessMemory {
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, MemoryError>;

    /// Writes regardless of the current page protection, restoring it afterwards.
    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Reserves read/write/execute memory. `near` is a hint for where to place it so that
    /// relative branches from there can reach it.
    fn allocate_executable(&mut self, size: usize, near: Option<Address>) -> Result<Address, MemoryError>;

    fn free(&mut self, address: Address) -> Result<(), MemoryError>;

    fn flush_instruction_cache(&mut self, _span: Span) -> Result<(), MemoryError> {
        Ok(())
    }
}

impl<T: ProcessMemory + ?Sized> ProcessMemory for Box<T> {
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, MemoryError> {
        (**self).read(address, length)
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        (**self).write(address, bytes)
    }

    fn allocate_executable(&mut self, size: usize, near: Option<Address>) -> Result<Address, MemoryError> {
        (**self).allocate_executable(size, near)
    }

    fn free(&mut self, address: Address) -> Result<(), MemoryError> {
        (**self).free(address)
    }

    fn flush_instruction_cache(&mut self, span: Span) -> Result<(), MemoryError> {
        (**self).flush_instruction_cache(span)
    }
}
