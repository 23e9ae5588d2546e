pub mod runtime;

pub use grapple_hook as hook;
pub use grapple_signal as signal;
pub use grapple_address as address;
pub use grapple_logging as logging;
pub use grapple_profile as profile;
pub use grapple_session as session;

pub mod dll {
    pub use grapple_dll::entrypoint;
}
