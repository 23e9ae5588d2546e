use log::{debug, trace, warn};

use grapple_address::{Address, Span};
use grapple_profile::{Architecture, ArgumentLocator};
use grapple_runtime::ProcessMemory;

use crate::error::HookError;
use crate::trampoline::{self, DispatchEntry, Trampoline, REL32_JUMP_LENGTH, TRAMPOLINE_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Pending,
    Installed,
    Failed,
}

/// Everything needed to put a patch back the way it was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledHook {
    pub name: String,
    pub target: Address,
    pub patch_width: usize,
    pub original: Vec<u8>,
    pub trampoline: Span,
    pub redirect: Vec<u8>,
    pub status: HookStatus,
}

impl InstalledHook {
    pub fn span(&self) -> Span {
        Span::new(self.target, self.patch_width)
    }
}

pub struct PatchRequest<'a> {
    pub name: &'a str,
    pub target: Address,
    pub patch_width: usize,
    pub architecture: Architecture,
    pub argument: &'a ArgumentLocator,
    pub dispatch: &'a [DispatchEntry],
}

impl PatchRequest<'_> {
    pub fn span(&self) -> Span {
        Span::new(self.target, self.patch_width)
    }
}

/// Owns a trampoline allocation until the patch is committed. Dropping it uncommitted
/// hands the memory back.
struct TrampolineGuard<'a> {
    memory: &'a mut dyn ProcessMemory,
    allocation: Option<Address>,
}

impl<'a> TrampolineGuard<'a> {
    fn allocate(memory: &'a mut dyn ProcessMemory, near: Address) -> Result<Self, HookError> {
        let allocation = memory.allocate_executable(TRAMPOLINE_CAPACITY, Some(near))?;

        Ok(Self { memory, allocation: Some(allocation) })
    }

    fn memory(&mut self) -> &mut dyn ProcessMemory {
        &mut *self.memory
    }

    fn commit(mut self) -> Option<Address> {
        self.allocation.take()
    }
}

impl Drop for TrampolineGuard<'_> {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            debug!("Releasing uncommitted trampoline at {}", allocation);
            if let Err(e) = self.memory.free(allocation) {
                warn!("Could not release trampoline at {}: {}", allocation, e);
            }
        }
    }
}

/// Writes a trampoline into the target and points `request.target` at it.
///
/// The trampoline is complete before the target bytes change and the target is re-read
/// right before the redirect goes in. Any failure leaves the target untouched.
pub fn install(memory: &mut dyn ProcessMemory, request: &PatchRequest) -> Result<InstalledHook, HookError> {
    let target = request.target;
    let width = request.patch_width;

    if width < REL32_JUMP_LENGTH {
        return Err(HookError::PatchWidthInsufficient {
            address: target,
            width,
            required: REL32_JUMP_LENGTH,
        });
    }

    let original = memory.read(target, width)?;
    let relocated = trampoline::decode_patch_region(request.architecture, target, &original)?;

    let mut guard = TrampolineGuard::allocate(memory, target)?;
    let at = guard.allocation.ok_or(HookError::Assembly("trampoline was not allocated".to_string()))?;

    let code = Trampoline {
        architecture: request.architecture,
        argument: request.argument,
        dispatch: request.dispatch,
        relocated: &relocated,
        resume: target.add(width),
    }.assemble(at)?;
    let redirect = trampoline::redirect(request.architecture, target, at, width)?;

    guard.memory().write(at, &code)?;
    guard.memory().flush_instruction_cache(Span::new(at, code.len()))?;
    trace!("Wrote {:#x} byte trampoline for {} at {}", code.len(), request.name, at);

    if guard.memory().read(target, width)? != original {
        return Err(HookError::PatchRaceDetected { address: target });
    }

    guard.memory().write(target, &redirect)?;
    guard.memory().flush_instruction_cache(request.span())?;
    guard.commit();

    debug!("Redirected {} at {} to {}", request.name, target, at);

    Ok(InstalledHook {
        name: request.name.to_string(),
        target,
        patch_width: width,
        original,
        trampoline: Span::new(at, TRAMPOLINE_CAPACITY),
        redirect,
        status: HookStatus::Installed,
    })
}

/// Puts the original bytes back and releases the trampoline. Refuses when the target no
/// longer holds the redirect that was written.
pub fn uninstall(memory: &mut dyn ProcessMemory, hook: &InstalledHook) -> Result<(), HookError> {
    if hook.status != HookStatus::Installed {
        return Ok(());
    }

    let current = memory.read(hook.target, hook.patch_width)?;
    if current != hook.redirect {
        return Err(HookError::PatchRaceDetected { address: hook.target });
    }

    memory.write(hook.target, &hook.original)?;
    memory.flush_instruction_cache(hook.span())?;
    memory.free(hook.trampoline.start)?;

    debug!("Restored {} at {}", hook.name, hook.target);
    Ok(())
}
