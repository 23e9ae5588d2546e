use std::sync::Arc;
use std::collections::HashMap;

use log::{error, info};

use grapple_profile::VariantProfile;
use grapple_runtime::{LoadedModule, ProcessMemory};

use crate::error::HookError;
use crate::patch::HookStatus;
use crate::process::{AttachedProcess, ProcessId};
use crate::registry::HookHandle;
use crate::resolver::{SymbolResolver, SymbolSource};

/// Installs a variant profile's hooks into every process the attach loop reports.
pub struct Instrumentor {
    profile: VariantProfile,
    processes: HashMap<ProcessId, AttachedProcess>,
    source: Option<Arc<dyn SymbolSource + Send + Sync>>,
}

impl Instrumentor {
    pub fn new(profile: VariantProfile) -> Self {
        Self { profile, processes: HashMap::new(), source: None }
    }

    pub fn with_symbol_source(mut self, source: Arc<dyn SymbolSource + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn profile(&self) -> &VariantProfile {
        &self.profile
    }

    pub fn attach(&mut self, id: ProcessId, memory: Box<dyn ProcessMemory>) -> &mut AttachedProcess {
        let resolver = match self.source.as_ref() {
            Some(source) => SymbolResolver::with_source(source.clone()),
            None => SymbolResolver::new(),
        };

        let mut process = AttachedProcess::new(id, memory, resolver);
        process.require(self.profile.hooks.iter().map(|h| h.name.as_str()));

        info!("Attached to process {} as {}", id, self.profile.tag);
        self.processes.entry(id).or_insert(process)
    }

    pub fn process(&self, id: ProcessId) -> Option<&AttachedProcess> {
        self.processes.get(&id)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut AttachedProcess> {
        self.processes.get_mut(&id)
    }

    pub fn set_stopped(&mut self, id: ProcessId, stopped: bool) -> Result<(), HookError> {
        self.processes.get_mut(&id)
            .ok_or(HookError::UnknownProcess(id))?
            .set_stopped(stopped);

        Ok(())
    }

    /// Fuzzing may start once this turns true.
    pub fn is_ready(&self, id: ProcessId) -> bool {
        self.processes.get(&id).map_or(false, |p| p.is_ready())
    }

    /// Records the module and installs every hook that became installable with it.
    /// Hooks that fail are logged and skipped, the process just won't become ready.
    pub fn on_module_load(&mut self, id: ProcessId, module: LoadedModule) -> Result<Vec<HookHandle>, HookError> {
        let process = self.processes.get_mut(&id)
            .ok_or(HookError::UnknownProcess(id))?;
        process.add_module(module);

        let mut installed = vec![];
        for spec in self.profile.hooks.iter() {
            if process.hooks().status(spec.name.as_str()) != Some(HookStatus::Pending) {
                continue;
            }

            if !process.can_install(spec) {
                continue;
            }

            match process.install(spec) {
                Ok(handle) => {
                    info!("Installed {} in process {} at {}", spec.name, id, handle.target);
                    installed.push(handle);
                },
                Err(e) if e.is_install_failure() => {
                    error!("{} is unavailable in process {}: {}", spec.name, id, e)
                },
                Err(e) => error!("Aborted installing {} in process {}: {}", spec.name, id, e),
            }
        }

        Ok(installed)
    }

    /// Takes out every hook that depends on the module so it goes in again once the module
    /// is back. Hooks inside the module lose their trampoline, hooks calling into it get
    /// their original bytes back, which needs the process stopped.
    pub fn on_module_unload(&mut self, id: ProcessId, name: &str) -> Result<(), HookError> {
        let process = self.processes.get_mut(&id)
            .ok_or(HookError::UnknownProcess(id))?;

        let mut result = Ok(());
        for spec in self.profile.hooks.iter() {
            if !spec.modules().any(|m| m.eq_ignore_ascii_case(name)) {
                continue;
            }

            let Some(target) = process.hooks().find(spec.name.as_str()).map(|h| h.target) else {
                process.mark_pending(spec.name.as_str());
                continue;
            };

            let outcome = if spec.module.eq_ignore_ascii_case(name) {
                process.forget(&target)
            } else {
                process.uninstall(&target)
            };

            match outcome {
                Ok(()) => info!("Removed {} from process {} as {} unloaded", spec.name, id, name),
                Err(e) => {
                    error!("Could not remove {} from process {}: {}", spec.name, id, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                },
            }
        }

        process.remove_module(name);
        result
    }

    /// Uninstalls everything and forgets the process. A running process stays attached
    /// and gets `TeardownRace` back.
    pub fn detach(&mut self, id: ProcessId) -> Result<(), HookError> {
        let process = self.processes.get_mut(&id)
            .ok_or(HookError::UnknownProcess(id))?;

        process.detach()?;
        self.processes.remove(&id);

        info!("Detached from process {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use grapple_address::{Address, Base, Offset};
    use grapple_profile::{EnvironmentTag, ProfileTable};
    use grapple_runtime::BufferedMemory;

    use super::*;

    const CHROME: usize = 0x7FF6_1000_0000;
    const PARSE_FLOAT: usize = 0x1000;
    const LOGGER: usize = 0x7FF6_2000_0000;
    const ARENA: usize = 0x7FF6_0FFF_0000;

    // mov rax, rdi / add rax, 1 / ret
    const FUNCTION: [u8; 8] = [0x48, 0x89, 0xF8, 0x48, 0x83, 0xC0, 0x01, 0xC3];

    fn profile() -> VariantProfile {
        let table = ProfileTable::from_toml_str(r#"
            [[profile]]
            tag = "CM"
            target_executable = "chrome.exe"
            encoding = "inline"

            [[profile.hooks]]
            name = "parseFloat"
            module = "chrome.dll"
            symbol = "v8::internal::Runtime_StringParseFloat"
            patch_width = 7
            architecture = "x86-64"
            argument = { slot = { register = "rdi" } }
            dispatch = [
                { marker = "session-open", module = "grapple_logger.dll", symbol = "GRAPPLE_startingTest" },
                { marker = "log-entry", module = "grapple_logger.dll", symbol = "GRAPPLE_logMessage" },
                { marker = "test-complete", module = "grapple_logger.dll", symbol = "GRAPPLE_finishedTest" },
            ]
        "#).unwrap();

        table.get(EnvironmentTag::Chrome).unwrap().clone()
    }

    fn memory() -> Box<dyn ProcessMemory> {
        let mut code = vec![0xCC; PARSE_FLOAT];
        code.extend_from_slice(&FUNCTION);

        let mut memory = BufferedMemory::new();
        memory.map(Address::from(CHROME), code);
        memory.with_arena(Address::from(ARENA), 0x1000);
        Box::new(memory)
    }

    fn chrome() -> LoadedModule {
        LoadedModule::new(
            "chrome.dll",
            Base::from(CHROME),
            vec![("?Runtime_StringParseFloat@internal@v8@@YAHH@Z".to_string(), Offset::from(PARSE_FLOAT))],
        )
    }

    fn logger() -> LoadedModule {
        LoadedModule::new(
            "grapple_logger.dll",
            Base::from(LOGGER),
            vec![
                ("GRAPPLE_startingTest".to_string(), Offset::from(0x1000usize)),
                ("GRAPPLE_logMessage".to_string(), Offset::from(0x1010usize)),
                ("GRAPPLE_finishedTest".to_string(), Offset::from(0x1020usize)),
            ],
        )
    }

    fn target() -> Address {
        Address::from(CHROME + PARSE_FLOAT)
    }

    #[test]
    fn hooks_wait_for_their_handler_module() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());

        assert!(instrumentor.on_module_load(1, chrome()).unwrap().is_empty());
        assert!(!instrumentor.is_ready(1));

        let installed = instrumentor.on_module_load(1, logger()).unwrap();

        assert_eq!(installed, vec![HookHandle { process: 1, target: target() }]);
        assert!(instrumentor.is_ready(1));

        let process = instrumentor.process(1).unwrap();
        assert_eq!(process.memory().read(target(), 1).unwrap(), vec![0xE9]);
    }

    #[test]
    fn later_module_loads_dont_patch_again() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());
        instrumentor.on_module_load(1, logger()).unwrap();
        instrumentor.on_module_load(1, chrome()).unwrap();

        let unrelated = LoadedModule::new("kernel32.dll", Base::from(0x7FFA_0000_0000usize), vec![]);
        assert!(instrumentor.on_module_load(1, unrelated).unwrap().is_empty());
        assert_eq!(instrumentor.process(1).unwrap().hooks().len(), 1);
    }

    #[test]
    fn unresolved_symbols_are_not_fatal() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());

        let stripped = LoadedModule::new("chrome.dll", Base::from(CHROME), vec![]);
        instrumentor.on_module_load(1, logger()).unwrap();

        assert!(instrumentor.on_module_load(1, stripped).unwrap().is_empty());
        assert!(!instrumentor.is_ready(1));
        assert_eq!(
            instrumentor.process(1).unwrap().hooks().status("parseFloat"),
            Some(HookStatus::Failed),
        );
    }

    #[test]
    fn processes_are_instrumented_independently() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());
        instrumentor.attach(2, memory());

        instrumentor.on_module_load(1, chrome()).unwrap();
        instrumentor.on_module_load(1, logger()).unwrap();

        assert!(instrumentor.is_ready(1));
        assert!(!instrumentor.is_ready(2));
        assert_eq!(
            instrumentor.process(2).unwrap().memory().read(target(), 8).unwrap(),
            FUNCTION.to_vec(),
        );
    }

    #[test]
    fn running_processes_refuse_to_detach() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());
        instrumentor.on_module_load(1, chrome()).unwrap();
        instrumentor.on_module_load(1, logger()).unwrap();

        instrumentor.set_stopped(1, false).unwrap();
        assert!(matches!(instrumentor.detach(1), Err(HookError::TeardownRace { process: 1 })));
        assert_eq!(instrumentor.process(1).unwrap().memory().read(target(), 1).unwrap(), vec![0xE9]);

        instrumentor.set_stopped(1, true).unwrap();
        let process = instrumentor.process_mut(1).unwrap();
        process.detach().unwrap();
        assert_eq!(process.memory().read(target(), 8).unwrap(), FUNCTION.to_vec());

        instrumentor.detach(1).unwrap();
        assert!(instrumentor.process(1).is_none());
    }

    #[test]
    fn hooks_follow_their_module_across_a_reload() {
        const RELOADED: usize = 0x7FF6_3000_0000;

        let mut code = vec![0xCC; PARSE_FLOAT];
        code.extend_from_slice(&FUNCTION);

        let mut memory = BufferedMemory::new();
        memory.map(Address::from(CHROME), code.clone());
        memory.map(Address::from(RELOADED), code);
        memory.with_arena(Address::from(ARENA), 0x1000);

        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, Box::new(memory));
        instrumentor.on_module_load(1, chrome()).unwrap();
        instrumentor.on_module_load(1, logger()).unwrap();
        assert!(instrumentor.is_ready(1));

        instrumentor.on_module_unload(1, "Chrome.dll").unwrap();

        let process = instrumentor.process(1).unwrap();
        assert!(!instrumentor.is_ready(1));
        assert!(process.hooks().is_empty());
        assert_eq!(process.hooks().status("parseFloat"), Some(HookStatus::Pending));

        let reloaded = LoadedModule::new(
            "chrome.dll",
            Base::from(RELOADED),
            vec![("?Runtime_StringParseFloat@internal@v8@@YAHH@Z".to_string(), Offset::from(PARSE_FLOAT))],
        );
        let installed = instrumentor.on_module_load(1, reloaded).unwrap();

        let target = Address::from(RELOADED + PARSE_FLOAT);
        assert_eq!(installed, vec![HookHandle { process: 1, target }]);
        assert!(instrumentor.is_ready(1));
        assert_eq!(instrumentor.process(1).unwrap().memory().read(target, 1).unwrap(), vec![0xE9]);
    }

    #[test]
    fn unloading_the_handler_module_restores_the_target() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());
        instrumentor.on_module_load(1, chrome()).unwrap();
        instrumentor.on_module_load(1, logger()).unwrap();
        instrumentor.set_stopped(1, true).unwrap();

        instrumentor.on_module_unload(1, "grapple_logger.dll").unwrap();

        let process = instrumentor.process(1).unwrap();
        assert!(!instrumentor.is_ready(1));
        assert_eq!(process.memory().read(target(), 8).unwrap(), FUNCTION.to_vec());
        assert_eq!(process.hooks().status("parseFloat"), Some(HookStatus::Pending));

        instrumentor.on_module_load(1, logger()).unwrap();
        assert!(instrumentor.is_ready(1));
    }

    #[test]
    fn failed_hooks_retry_after_their_module_reloads() {
        let mut instrumentor = Instrumentor::new(profile());
        instrumentor.attach(1, memory());
        instrumentor.on_module_load(1, logger()).unwrap();

        let stripped = LoadedModule::new("chrome.dll", Base::from(CHROME), vec![]);
        instrumentor.on_module_load(1, stripped).unwrap();
        assert_eq!(instrumentor.process(1).unwrap().hooks().status("parseFloat"), Some(HookStatus::Failed));

        instrumentor.on_module_unload(1, "chrome.dll").unwrap();
        instrumentor.on_module_load(1, chrome()).unwrap();

        assert!(instrumentor.is_ready(1));
    }

    #[test]
    fn unknown_processes_are_errors() {
        let mut instrumentor = Instrumentor::new(profile());

        assert!(matches!(instrumentor.on_module_load(9, chrome()), Err(HookError::UnknownProcess(9))));
        assert!(matches!(instrumentor.detach(9), Err(HookError::UnknownProcess(9))));
        assert!(!instrumentor.is_ready(9));
    }
}
