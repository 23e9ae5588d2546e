use std::collections::HashMap;

use grapple_profile::{classify, EnvironmentTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Started,
    Finished,
}

/// One lifetime of the scripting environment. Holds the counters every log call advances.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub environment: EnvironmentTag,
    next_index: usize,
    ordinals: HashMap<String, usize>,
    state: SessionState,
}

impl Session {
    /// Classifies the environment from its user agent.
    pub fn new(name: &str, user_agent: &str) -> Self {
        Self::with_environment(name, classify(user_agent))
    }

    pub fn with_environment(name: &str, environment: EnvironmentTag) -> Self {
        Self {
            name: name.to_string(),
            environment,
            next_index: 0,
            ordinals: HashMap::new(),
            state: SessionState::NotStarted,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// `"<type>_<n>"` where `n` counts calls for that type, starting at zero.
    pub fn unique_id(&mut self, kind: &str) -> String {
        let ordinal = self.ordinals.entry(kind.to_string()).or_insert(0);
        let id = format!("{}_{}", kind, ordinal);
        *ordinal += 1;
        id
    }

    pub(crate) fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }
}
