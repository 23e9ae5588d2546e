use std::io;
use std::env;
use std::fmt;
use std::collections::HashSet;

use log::{debug, info};
use serde::Deserialize;

pub mod variant;
pub mod environment;

pub use environment::{classify, ChannelEncoding, EnvironmentTag};
pub use variant::{
    Architecture, ArgumentLocator, ArgumentSlot, Completion, DispatchSpec, HookSpec, Register,
    VariantProfile,
};

pub const PROFILE_PATH_VARIABLE: &str = "GRAPPLE_PROFILE";

const BUILTIN_PROFILES: &str = include_str!("../profiles/builtin.toml");

#[derive(Debug)]
pub enum ProfileError {
    FileReadError(io::Error),
    ConfigParseError(toml::de::Error),
    DuplicateTag(EnvironmentTag),
    DuplicateMarker { hook: String },
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::FileReadError(e) => write!(f, "could not read profile file: {}", e),
            ProfileError::ConfigParseError(e) => write!(f, "could not parse profiles: {}", e),
            ProfileError::DuplicateTag(tag) => write!(f, "profile {} is defined twice", tag),
            ProfileError::DuplicateMarker { hook } => {
                write!(f, "hook {} dispatches the same marker twice", hook)
            },
        }
    }
}

impl std::error::Error for ProfileError {}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profile: Vec<VariantProfile>,
}

/// One record per supported environment. Adding an environment means adding a record.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: Vec<VariantProfile>,
}

impl ProfileTable {
    pub fn builtin() -> Result<Self, ProfileError> {
        Self::from_toml_str(BUILTIN_PROFILES)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ProfileError> {
        let file: ProfileFile = toml::from_str(contents)
            .map_err(ProfileError::ConfigParseError)?;

        Self::new(file.profile)
    }

    pub fn read(path: &str) -> Result<Self, ProfileError> {
        let contents = std::fs::read_to_string(path)
            .map_err(ProfileError::FileReadError)?;

        Self::from_toml_str(contents.as_str())
    }

    /// Reads the file named by `GRAPPLE_PROFILE`, falling back to the built-in table.
    pub fn load() -> Result<Self, ProfileError> {
        match env::var(PROFILE_PATH_VARIABLE) {
            Ok(path) => {
                info!("Loading variant profiles from {}", path);
                Self::read(path.as_str())
            },
            Err(_) => Self::builtin(),
        }
    }

    pub fn new(profiles: Vec<VariantProfile>) -> Result<Self, ProfileError> {
        let mut tags = HashSet::new();

        for profile in profiles.iter() {
            if !tags.insert(profile.tag) {
                return Err(ProfileError::DuplicateTag(profile.tag));
            }

            for hook in profile.hooks.iter() {
                let mut markers = HashSet::new();
                if !hook.dispatch.iter().all(|d| markers.insert(d.marker)) {
                    return Err(ProfileError::DuplicateMarker { hook: hook.name.clone() });
                }
            }
        }

        debug!("Loaded {} variant profiles", profiles.len());
        Ok(Self { profiles })
    }

    pub fn get(&self, tag: EnvironmentTag) -> Option<&VariantProfile> {
        self.profiles.iter().find(|p| p.tag == tag)
    }

    pub fn profiles(&self) -> &[VariantProfile] {
        self.profiles.as_slice()
    }

    /// Encoding for a tag. Environments without a record get the default variant.
    pub fn encoding_for(&self, tag: EnvironmentTag) -> ChannelEncoding {
        self.get(tag)
            .map(|p| p.encoding)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapple_signal::Marker;

    #[test]
    fn builtin_profiles_parse() {
        let table = ProfileTable::builtin().unwrap();

        assert_eq!(table.profiles().len(), 5);
        for profile in table.profiles() {
            assert!(!profile.hooks.is_empty(), "{} has no required hooks", profile.tag);
        }
    }

    #[test]
    fn chrome_profile_hooks_parse_float() {
        let table = ProfileTable::builtin().unwrap();
        let chrome = table.get(EnvironmentTag::Chrome).unwrap();
        let hook = &chrome.hooks[0];

        assert_eq!(chrome.target_executable, "chrome.exe");
        assert_eq!(chrome.extra_arguments, vec!["--no-sandbox".to_string()]);
        assert_eq!(chrome.encoding, ChannelEncoding::Inline);
        assert_eq!(hook.module, "chrome.dll");
        assert_eq!(hook.patch_width, 5);
        assert_eq!(hook.architecture, Architecture::X86);
        assert_eq!(hook.argument.slot, ArgumentSlot::Stack(8));
        assert_eq!(hook.argument.indirections, vec![0]);
        assert_eq!(hook.argument.payload_offset, 0x0B);
        assert_eq!(hook.dispatch[1].marker, Marker::LogEntry);
        assert_eq!(hook.dispatch[1].completion, Completion::FallThrough);
        assert_eq!(hook.modules().collect::<Vec<_>>(), vec!["chrome.dll", "grapple_logger.dll", "grapple_logger.dll", "grapple_logger.dll"]);
    }

    #[test]
    fn unknown_environments_degrade_to_the_default_encoding() {
        let table = ProfileTable::builtin().unwrap();

        assert_eq!(table.get(EnvironmentTag::Unknown), None);
        assert_eq!(table.encoding_for(EnvironmentTag::Unknown), ChannelEncoding::Split);
        assert_eq!(table.encoding_for(EnvironmentTag::InternetExplorer), ChannelEncoding::Split);
        assert_eq!(table.encoding_for(EnvironmentTag::Firefox), ChannelEncoding::Inline);
    }

    #[test]
    fn we_can_parse_register_slots_and_return_completions() {
        let table = ProfileTable::from_toml_str(r#"
            [[profile]]
            tag = "CM"
            target_executable = "chrome.exe"

            [[profile.hooks]]
            name = "parseFloat"
            module = "chrome.dll"
            symbol = "parse_float"
            patch_width = 14
            architecture = "x86-64"
            argument = { slot = { register = "rcx" } }
            dispatch = [
                { marker = "log-entry", module = "log.dll", symbol = "log", completion = { return = { value = 0 } } },
            ]
        "#).unwrap();

        let hook = &table.profiles()[0].hooks[0];
        assert_eq!(hook.architecture, Architecture::X86_64);
        assert_eq!(hook.argument.slot, ArgumentSlot::Register(Register::Rcx));
        assert!(hook.argument.indirections.is_empty());
        assert_eq!(hook.dispatch[0].completion, Completion::Return { value: 0, stack_bytes: 0 });
        assert_eq!(table.profiles()[0].encoding, ChannelEncoding::Split);
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let result = ProfileTable::from_toml_str(r#"
            [[profile]]
            tag = "FF"
            target_executable = "firefox.exe"

            [[profile]]
            tag = "FF"
            target_executable = "firefox.exe"
        "#);

        assert!(matches!(result, Err(ProfileError::DuplicateTag(EnvironmentTag::Firefox))));
    }

    #[test]
    fn duplicate_markers_within_a_hook_are_rejected() {
        let result = ProfileTable::from_toml_str(r#"
            [[profile]]
            tag = "SF"
            target_executable = "safari.exe"

            [[profile.hooks]]
            name = "parseFloat"
            module = "a.dll"
            symbol = "f"
            patch_width = 5
            argument = { slot = { stack = 4 } }
            dispatch = [
                { marker = "log-entry", module = "b.dll", symbol = "x" },
                { marker = "log-entry", module = "b.dll", symbol = "y" },
            ]
        "#);

        assert!(matches!(result, Err(ProfileError::DuplicateMarker { .. })));
    }

    #[test]
    fn malformed_profiles_are_parse_errors() {
        let result = ProfileTable::from_toml_str("[[profile]]\ntag = \"XX\"\n");

        assert!(matches!(result, Err(ProfileError::ConfigParseError(_))));
    }
}
