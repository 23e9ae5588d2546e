use std::sync::Arc;
use std::sync::OnceLock;
use std::collections::HashMap;

use log::{debug, trace};
use regex::Regex;
use msvc_demangler::demangle;

use grapple_address::{Address, Offset};
use grapple_runtime::LoadedModule;

use crate::error::HookError;

/// Remote symbol lookup keyed by module identity, for symbols a module doesn't export.
pub trait SymbolSource {
    fn lookup(&self, module: &LoadedModule, symbol: &str) -> Option<Offset>;
}

/// Maps (module, symbol) to an address inside one process. Results are cached, misses too.
#[derive(Default)]
pub struct SymbolResolver {
    cache: HashMap<(String, String), Option<Address>>,
    source: Option<Arc<dyn SymbolSource + Send + Sync>>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: Arc<dyn SymbolSource + Send + Sync>) -> Self {
        Self { cache: HashMap::new(), source: Some(source) }
    }

    pub fn resolve(&mut self, module: &LoadedModule, symbol: &str) -> Result<Address, HookError> {
        let key = (module.name.to_ascii_lowercase(), symbol.to_string());

        let resolved = match self.cache.get(&key) {
            Some(cached) => *cached,
            None => {
                let resolved = self.lookup(module, symbol);
                self.cache.insert(key, resolved);
                resolved
            },
        };

        resolved.ok_or_else(|| HookError::SymbolNotFound {
            module: module.name.clone(),
            symbol: symbol.to_string(),
        })
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Forgets everything about a module, for when it gets unloaded.
    pub fn forget_module(&mut self, module: &str) {
        let module = module.to_ascii_lowercase();
        self.cache.retain(|(m, _), _| *m != module);
    }

    fn lookup(&self, module: &LoadedModule, symbol: &str) -> Option<Address> {
        if let Some(address) = module.export(symbol) {
            trace!("Resolved {}!{} through the export table", module.name, symbol);
            return Some(address);
        }

        let undecorated = module.exports()
            .find(|(name, _)| undecorate(name).as_deref() == Some(symbol))
            .map(|(_, address)| address);
        if undecorated.is_some() {
            trace!("Resolved {}!{} through a decorated export", module.name, symbol);
            return undecorated;
        }

        let remote = self.source.as_ref()
            .and_then(|s| s.lookup(module, symbol))
            .map(|offset| &module.base + &offset);
        match remote {
            Some(_) => trace!("Resolved {}!{} through the symbol source", module.name, symbol),
            None => debug!("Could not resolve {}!{}", module.name, symbol),
        }

        remote
    }
}

/// Qualified name behind a decorated export, if it is decorated at all.
pub fn undecorate(name: &str) -> Option<String> {
    if name.starts_with('?') {
        let demangled = demangle(name, msvc_demangler::DemangleFlags::llvm()).ok()?;

        // Calling convention and return type come first, the parameter list last.
        return qualified_name_pattern()
            .captures(demangled.as_str())
            .map(|c| c[1].to_string());
    }

    stdcall_pattern()
        .captures(name)
        .map(|c| c[1].to_string())
}

fn qualified_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"([^\s(*&]+)\(").unwrap())
}

fn stdcall_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^_([A-Za-z_]\w*)@\d+$").unwrap())
}
