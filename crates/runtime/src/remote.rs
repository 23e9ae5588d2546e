use std::ffi;
use std::collections::HashMap;

use log::{trace, warn};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{FlushInstructionCache, ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Memory::{
    VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};

use grapple_address::{Address, Span};

use crate::memory::{MemoryError, ProcessMemory};

const ALLOCATION_GRANULARITY: usize = 0x10000;
const NEAR_ALLOCATION_ATTEMPTS: usize = 0x4000;

/// Another process's address space, reached through a handle owned by the attach loop.
pub struct RemoteProcess {
    handle: HANDLE,
    allocations: HashMap<Address, usize>,
}

impl RemoteProcess {
    /// The handle needs `PROCESS_VM_OPERATION | PROCESS_VM_READ | PROCESS_VM_WRITE` and
    /// stays owned by the caller.
    pub fn new(handle: HANDLE) -> Self {
        Self { handle, allocations: HashMap::new() }
    }

    fn try_allocate(&self, hint: Option<usize>, size: usize) -> Option<Address> {
        let result = unsafe {
            VirtualAllocEx(
                self.handle,
                hint.map(|h| h as *const ffi::c_void),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };

        if result.is_null() {
            None
        } else {
            Some(Address::from(result as usize))
        }
    }
}

impl ProcessMemory for RemoteProcess {
    fn read(&self, address: Address, length: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buffer = vec![0u8; length];
        let mut read = 0usize;

        let success = unsafe {
            ReadProcessMemory(
                self.handle,
                address.as_usize() as *const ffi::c_void,
                buffer.as_mut_ptr() as *mut ffi::c_void,
                length,
                Some(&mut read as *mut usize),
            )
        };

        if !success.as_bool() || read != length {
            return Err(MemoryError::ReadFailed { address, length });
        }

        Ok(buffer)
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        let length = bytes.len();
        let target = address.as_usize() as *const ffi::c_void;
        let mut old_protection = PAGE_PROTECTION_FLAGS::default();

        let unprotected = unsafe {
            VirtualProtectEx(self.handle, target, length, PAGE_EXECUTE_READWRITE, &mut old_protection)
        };
        if !unprotected.as_bool() {
            return Err(MemoryError::ProtectFailed { address, length });
        }

        let mut written = 0usize;
        let success = unsafe {
            WriteProcessMemory(
                self.handle,
                target,
                bytes.as_ptr() as *const ffi::c_void,
                length,
                Some(&mut written as *mut usize),
            )
        };

        let mut ignored = PAGE_PROTECTION_FLAGS::default();
        let restored = unsafe {
            VirtualProtectEx(self.handle, target, length, old_protection, &mut ignored)
        };
        if !restored.as_bool() {
            warn!("Could not restore protection {:#x} at {}", old_protection.0, address);
        }

        if !success.as_bool() || written != length {
            return Err(MemoryError::WriteFailed { address, length });
        }

        Ok(())
    }

    fn allocate_executable(&mut self, size: usize, near: Option<Address>) -> Result<Address, MemoryError> {
        // Walk down from the hint one allocation granule at a time so that a rel32 jump
        // from `near` can still reach the result.
        let near_result = near.and_then(|near| {
            let start = near.as_usize() & !(ALLOCATION_GRANULARITY - 1);
            (1..NEAR_ALLOCATION_ATTEMPTS)
                .filter_map(|i| start.checked_sub(i * ALLOCATION_GRANULARITY))
                .find_map(|candidate| self.try_allocate(Some(candidate), size))
        });

        let address = match near_result {
            Some(address) => address,
            None => self.try_allocate(None, size)
                .ok_or(MemoryError::AllocationFailed { size })?,
        };

        trace!("Allocated {:#x} executable bytes at {}", size, address);
        self.allocations.insert(address, size);
        Ok(address)
    }

    fn free(&mut self, address: Address) -> Result<(), MemoryError> {
        if self.allocations.remove(&address).is_none() {
            return Err(MemoryError::FreeFailed { address });
        }

        let success = unsafe {
            VirtualFreeEx(self.handle, address.as_usize() as *mut ffi::c_void, 0, MEM_RELEASE)
        };

        if !success.as_bool() {
            return Err(MemoryError::FreeFailed { address });
        }

        Ok(())
    }

    fn flush_instruction_cache(&mut self, span: Span) -> Result<(), MemoryError> {
        let success = unsafe {
            FlushInstructionCache(
                self.handle,
                Some(span.start.as_usize() as *const ffi::c_void),
                span.length,
            )
        };

        if !success.as_bool() {
            warn!("Could not flush the instruction cache for {:?}", span);
        }

        Ok(())
    }
}
