use log::{debug, trace};

use grapple_profile::{ChannelEncoding, ProfileTable};
use grapple_signal::codec::Marker;
use grapple_signal::document;

use crate::channel::{self, NarrowChannel};
use crate::message::LogMessage;
use crate::session::{Session, SessionState};
use crate::SessionError;

/// Turns fuzzer actions into log document fragments and pushes each one through the
/// narrow channel as it happens.
pub struct SessionLogger<C: NarrowChannel> {
    channel: C,
    encoding: ChannelEncoding,
}

impl<C: NarrowChannel> SessionLogger<C> {
    pub fn new(channel: C, encoding: ChannelEncoding) -> Self {
        Self { channel, encoding }
    }

    /// Picks the encoding the profile table prescribes for the session's environment.
    pub fn for_session(channel: C, profiles: &ProfileTable, session: &Session) -> Self {
        Self::new(channel, profiles.encoding_for(session.environment))
    }

    pub fn encoding(&self) -> ChannelEncoding {
        self.encoding
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn starting(&mut self, session: &mut Session) -> Result<(), SessionError> {
        match session.state() {
            SessionState::NotStarted => {},
            SessionState::Started => return Err(SessionError::AlreadyStarted),
            SessionState::Finished => return Err(SessionError::AlreadyFinished),
        }

        let header = document::session_open(&session.name, session.environment.code());
        self.emit(Marker::SessionOpen, &header);
        session.set_state(SessionState::Started);

        debug!("Session {} started in {}", session.name, session.environment);
        Ok(())
    }

    /// Logs a statement or a sequence and returns the index it was recorded under. Empty
    /// sequences record nothing and return `None`.
    ///
    /// `location` defaults to empty and `count` to 1. Children of a sequence share its
    /// location and are logged with a count of 1.
    pub fn log(
        &mut self,
        session: &mut Session,
        message: impl Into<LogMessage>,
        location: Option<&str>,
        count: Option<u32>,
    ) -> Result<Option<usize>, SessionError> {
        match session.state() {
            SessionState::Started => {},
            SessionState::NotStarted => return Err(SessionError::NotStarted),
            SessionState::Finished => return Err(SessionError::AlreadyFinished),
        }

        let message = message.into();
        Ok(self.log_message(session, &message, location.unwrap_or(""), count.unwrap_or(1)))
    }

    pub fn finished(&mut self, session: &mut Session) -> Result<(), SessionError> {
        match session.state() {
            SessionState::Started => {},
            SessionState::NotStarted => return Err(SessionError::NotStarted),
            SessionState::Finished => return Err(SessionError::AlreadyFinished),
        }

        self.emit(Marker::TestComplete, document::SESSION_CLOSE);
        session.set_state(SessionState::Finished);

        debug!("Session {} finished after {} records", session.name, session.next_index());
        Ok(())
    }

    fn log_message(
        &mut self,
        session: &mut Session,
        message: &LogMessage,
        location: &str,
        count: u32,
    ) -> Option<usize> {
        match message {
            LogMessage::Statement(statement) => {
                let index = session.take_index();
                self.emit(Marker::LogEntry, &document::statement(index, location, statement, count));
                Some(index)
            },
            LogMessage::Sequence(children) if children.is_empty() => None,
            LogMessage::Sequence(children) => {
                let index = session.take_index();
                self.emit(Marker::LogEntry, &document::sequence_open(index, location, count));
                for child in children.iter() {
                    self.log_message(session, child, location, 1);
                }
                self.emit(Marker::LogEntry, document::SEQUENCE_CLOSE);
                Some(index)
            },
        }
    }

    fn emit(&mut self, marker: Marker, payload: &str) {
        trace!("Emitting {} ({} bytes)", marker, payload.len());
        let argument = channel::argument(self.encoding, marker, payload);
        self.channel.call(&argument);
    }
}
