use serde::{Deserialize, Serialize};

use grapple_signal::Marker;

use crate::environment::{ChannelEncoding, EnvironmentTag};

/// Everything that differs between supported hosting environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantProfile {
    pub tag: EnvironmentTag,
    pub target_executable: String,

    #[serde(default)]
    pub extra_arguments: Vec<String>,

    #[serde(default)]
    pub symbol_server: Option<String>,

    #[serde(default)]
    pub encoding: ChannelEncoding,

    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

/// One hook the profile requires before fuzzing may begin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    pub module: String,
    pub symbol: String,
    pub patch_width: usize,

    #[serde(default)]
    pub architecture: Architecture,

    pub argument: ArgumentLocator,
    pub dispatch: Vec<DispatchSpec>,
}

impl HookSpec {
    /// Every module that has to be loaded before this hook can go in.
    pub fn modules(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.module.as_str())
            .chain(self.dispatch.iter().map(|d| d.module.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Architecture {
    #[default]
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86-64")]
    X86_64,
}

impl Architecture {
    pub fn bitness(&self) -> u32 {
        match self {
            Architecture::X86 => 32,
            Architecture::X86_64 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsi,
    Rdi,
    R8,
    R9,
}

/// Where the intercepted call's argument lives on entry to the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgumentSlot {
    Register(Register),
    /// Byte offset from the stack pointer at entry; `[sp]` is the return address.
    Stack(u32),
}

/// Path from the argument slot to the first code unit of the string argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentLocator {
    pub slot: ArgumentSlot,

    /// Each entry loads a pointer from `[current + offset]`.
    #[serde(default)]
    pub indirections: Vec<i32>,

    #[serde(default)]
    pub payload_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSpec {
    pub marker: Marker,
    pub module: String,
    pub symbol: String,

    #[serde(default)]
    pub completion: Completion,
}

/// What happens after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Completion {
    /// Restore state and run the original function as if nothing happened.
    #[default]
    FallThrough,
    /// Skip the original function and return `value`, popping `stack_bytes` of arguments.
    Return {
        value: u64,
        #[serde(default)]
        stack_bytes: u16,
    },
}
