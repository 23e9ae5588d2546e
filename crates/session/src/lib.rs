use std::fmt;

pub mod channel;
pub mod logger;
pub mod message;
pub mod session;

pub use channel::NarrowChannel;
pub use logger::SessionLogger;
pub use message::LogMessage;
pub use session::{Session, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    NotStarted,
    AlreadyStarted,
    AlreadyFinished,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotStarted => write!(f, "session has not been started"),
            SessionError::AlreadyStarted => write!(f, "session was already started"),
            SessionError::AlreadyFinished => write!(f, "session is already finished"),
        }
    }
}

impl std::error::Error for SessionError {}
