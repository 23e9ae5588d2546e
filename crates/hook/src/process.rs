use std::collections::HashMap;

use log::{debug, warn};

use grapple_address::Address;
use grapple_profile::HookSpec;
use grapple_runtime::{LoadedModule, ProcessMemory};

use crate::error::HookError;
use crate::patch::PatchRequest;
use crate::registry::{HookHandle, HookRegistry};
use crate::resolver::SymbolResolver;
use crate::trampoline::DispatchEntry;

pub type ProcessId = u32;

/// A process the attach loop handed over, with everything hooked into it.
pub struct AttachedProcess {
    pub id: ProcessId,
    memory: Box<dyn ProcessMemory>,
    modules: HashMap<String, LoadedModule>,
    resolver: SymbolResolver,
    hooks: HookRegistry,
    stopped: bool,
}

impl AttachedProcess {
    /// Attaching happens at a stopped point so processes start out stopped.
    pub fn new(id: ProcessId, memory: Box<dyn ProcessMemory>, resolver: SymbolResolver) -> Self {
        Self {
            id,
            memory,
            modules: HashMap::new(),
            resolver,
            hooks: HookRegistry::new(),
            stopped: true,
        }
    }

    pub fn memory(&self) -> &dyn ProcessMemory {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut dyn ProcessMemory {
        self.memory.as_mut()
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        self.stopped = stopped;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_ready(&self) -> bool {
        self.hooks.is_ready()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn require<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        self.hooks.require(names)
    }

    pub fn add_module(&mut self, module: LoadedModule) {
        debug!("Process {} loaded {} at {:?}", self.id, module.name, module.base);
        self.modules.insert(module.name.to_ascii_lowercase(), module);
    }

    pub fn remove_module(&mut self, name: &str) -> Option<LoadedModule> {
        self.resolver.forget_module(name);
        self.modules.remove(&name.to_ascii_lowercase())
    }

    pub fn module(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.get(&name.to_ascii_lowercase())
    }

    /// Every module the hook touches is loaded.
    pub fn can_install(&self, spec: &HookSpec) -> bool {
        spec.modules().all(|m| self.module(m).is_some())
    }

    /// Resolves the hook's target and handlers and patches it in. Failures are recorded
    /// against the hook's name so readiness reflects them.
    pub fn install(&mut self, spec: &HookSpec) -> Result<HookHandle, HookError> {
        let result = self.try_install(spec);
        if result.is_err() {
            self.hooks.mark_failed(spec.name.as_str());
        }

        result
    }

    fn try_install(&mut self, spec: &HookSpec) -> Result<HookHandle, HookError> {
        let module = self.modules.get(&spec.module.to_ascii_lowercase())
            .ok_or_else(|| HookError::SymbolNotFound {
                module: spec.module.clone(),
                symbol: spec.symbol.clone(),
            })?;
        let target = self.resolver.resolve(module, spec.symbol.as_str())?;

        let dispatch = spec.dispatch.iter()
            .map(|d| {
                let handler_module = self.modules.get(&d.module.to_ascii_lowercase())
                    .ok_or_else(|| HookError::HandlerModuleNotLoaded { module: d.module.clone() })?;
                let handler = self.resolver.resolve(handler_module, d.symbol.as_str())?;

                Ok(DispatchEntry { marker: d.marker, handler, completion: d.completion })
            })
            .collect::<Result<Vec<_>, HookError>>()?;

        if !self.stopped {
            warn!(
                "Installing {} into running process {}, threads may execute the target while it is rewritten",
                spec.name,
                self.id,
            );
        }

        let target = self.hooks.install(self.memory.as_mut(), &PatchRequest {
            name: spec.name.as_str(),
            target,
            patch_width: spec.patch_width,
            architecture: spec.architecture,
            argument: &spec.argument,
            dispatch: &dispatch,
        })?;

        Ok(HookHandle { process: self.id, target })
    }

    pub fn uninstall(&mut self, target: &Address) -> Result<(), HookError> {
        if !self.stopped {
            return Err(HookError::TeardownRace { process: self.id });
        }

        self.hooks.uninstall(self.memory.as_mut(), target)
    }

    /// Releases the trampoline of a hook whose target module unloaded.
    pub fn forget(&mut self, target: &Address) -> Result<(), HookError> {
        self.hooks.forget(self.memory.as_mut(), target)
    }

    pub fn mark_pending(&mut self, name: &str) {
        self.hooks.mark_pending(name)
    }

    /// Removes every hook. Refused while the process runs.
    pub fn detach(&mut self) -> Result<(), HookError> {
        if !self.stopped {
            return Err(HookError::TeardownRace { process: self.id });
        }

        self.hooks.uninstall_all(self.memory.as_mut())
    }
}
