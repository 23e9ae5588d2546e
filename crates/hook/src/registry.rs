use std::fmt;
use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};

use grapple_address::Address;
use grapple_runtime::ProcessMemory;

use crate::error::HookError;
use crate::patch::{self, HookStatus, InstalledHook, PatchRequest};
use crate::process::ProcessId;

/// Identifies an installed hook across the whole instrumentor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    pub process: ProcessId,
    pub target: Address,
}

impl fmt::Display for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.process, self.target)
    }
}

/// Hooks of a single process, keyed by target address.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<Address, InstalledHook>,
    required: HashMap<String, HookStatus>,
    ready: bool,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names every hook that has to be installed before the process counts as ready.
    pub fn require<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.required.entry(name.to_string()).or_insert(HookStatus::Pending);
        }
        self.recompute_readiness();
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn status(&self, name: &str) -> Option<HookStatus> {
        self.required.get(name).copied()
    }

    pub fn get(&self, target: &Address) -> Option<&InstalledHook> {
        self.hooks.get(target)
    }

    pub fn find(&self, name: &str) -> Option<&InstalledHook> {
        self.hooks.values().find(|h| h.name == name)
    }

    pub fn hooks(&self) -> impl Iterator<Item = &InstalledHook> {
        self.hooks.values()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Installs a hook unless one already sits at the same target, in which case that one
    /// is returned untouched.
    pub fn install(
        &mut self,
        memory: &mut dyn ProcessMemory,
        request: &PatchRequest,
    ) -> Result<Address, HookError> {
        if let Some(existing) = self.hooks.get(&request.target) {
            if existing.status == HookStatus::Installed {
                debug!("{} is already installed at {}", request.name, request.target);
                return Ok(existing.target);
            }
        }

        let span = request.span();
        let overlapping = self.hooks.values()
            .filter(|h| h.status == HookStatus::Installed)
            .find(|h| h.span().overlaps(&span));
        if let Some(existing) = overlapping {
            let error = HookError::OverlappingPatch {
                address: request.target,
                existing: existing.target,
            };
            self.mark_failed(request.name);
            return Err(error);
        }

        match patch::install(memory, request) {
            Ok(hook) => {
                let target = hook.target;
                self.hooks.insert(target, hook);
                if let Some(status) = self.required.get_mut(request.name) {
                    *status = HookStatus::Installed;
                }
                self.recompute_readiness();

                Ok(target)
            },
            Err(e) => {
                self.mark_failed(request.name);
                Err(e)
            },
        }
    }

    /// Records that a hook could not go in, for instance because its symbol didn't resolve.
    pub fn mark_failed(&mut self, name: &str) {
        if let Some(status) = self.required.get_mut(name) {
            *status = HookStatus::Failed;
        }
        self.recompute_readiness();
    }

    /// Restores the original bytes at `target`. Unknown targets are already uninstalled.
    pub fn uninstall(&mut self, memory: &mut dyn ProcessMemory, target: &Address) -> Result<(), HookError> {
        let hook = match self.hooks.get(target) {
            Some(hook) => hook,
            None => return Ok(()),
        };

        patch::uninstall(memory, hook)?;

        if let Some(hook) = self.hooks.remove(target) {
            if let Some(status) = self.required.get_mut(&hook.name) {
                *status = HookStatus::Pending;
            }
        }
        self.recompute_readiness();

        Ok(())
    }

    /// Drops the hook at `target` after its module went away. The target bytes are gone with
    /// the module so only the trampoline is released.
    pub fn forget(&mut self, memory: &mut dyn ProcessMemory, target: &Address) -> Result<(), HookError> {
        let Some(hook) = self.hooks.remove(target) else {
            return Ok(());
        };

        if let Some(status) = self.required.get_mut(&hook.name) {
            *status = HookStatus::Pending;
        }
        self.recompute_readiness();

        memory.free(hook.trampoline.start)?;
        Ok(())
    }

    /// Gives a failed hook another chance, for instance once its module loads again.
    pub fn mark_pending(&mut self, name: &str) {
        if let Some(status) = self.required.get_mut(name) {
            if *status == HookStatus::Failed {
                *status = HookStatus::Pending;
            }
        }
    }

    /// Removes every hook. Keeps going past failures and reports the first one.
    pub fn uninstall_all(&mut self, memory: &mut dyn ProcessMemory) -> Result<(), HookError> {
        let targets = self.hooks.keys().copied().collect::<Vec<_>>();

        let mut first_error = None;
        for target in targets.iter() {
            if let Err(e) = self.uninstall(memory, target) {
                warn!("Could not remove hook at {}: {}", target, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn recompute_readiness(&mut self) {
        let ready = !self.required.is_empty()
            && self.required.values().all(|s| *s == HookStatus::Installed);

        if ready && !self.ready {
            info!("All {} required hooks are installed", self.required.len());
        }
        self.ready = ready;
    }
}
