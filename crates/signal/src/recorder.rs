use std::io;
use std::io::Write;

use log::{debug, warn};

use crate::codec::{self, Decoded, Marker, SentinelMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    AwaitingSession,
    Recording,
    Finished,
}

/// Host side of the channel. Appends payloads to the log document strictly in the order
/// they arrive; nothing is buffered beyond the writer itself.
pub struct Recorder<W: Write> {
    writer: W,
    state: RecorderState,
    recorded: usize,
    dropped: usize,
}

impl<W: Write> Recorder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: RecorderState::AwaitingSession,
            recorded: 0,
            dropped: 0,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn recorded(&self) -> usize {
        self.recorded
    }

    /// Messages thrown away because they could not be decoded or arrived after the session
    /// was closed.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn record(&mut self, message: &SentinelMessage) -> io::Result<()> {
        if self.state == RecorderState::Finished {
            warn!("Dropping {} after the session was finished", message.marker);
            self.dropped += 1;
            return Ok(());
        }

        match (self.state, message.marker) {
            (RecorderState::AwaitingSession, Marker::LogEntry) => {
                warn!("Log entry arrived before the session was opened");
            },
            (RecorderState::Recording, Marker::SessionOpen) => {
                warn!("Session opened twice");
            },
            _ => {},
        }

        self.writer.write_all(message.payload.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.recorded += 1;

        self.state = match message.marker {
            Marker::TestComplete => {
                self.writer.flush()?;
                debug!("Session finished after {} messages", self.recorded);
                RecorderState::Finished
            },
            _ => RecorderState::Recording,
        };

        Ok(())
    }

    /// Entry point for a handler that already knows its marker and got the units that
    /// follow it. Malformed payloads are dropped.
    pub fn record_units(&mut self, marker: Marker, units: &[u16]) -> io::Result<()> {
        match codec::decode_payload(marker, units) {
            Ok(message) => self.record(&message),
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                self.dropped += 1;
                Ok(())
            },
        }
    }

    /// Classifies a complete raw argument. Returns whether it carried a signal.
    pub fn dispatch(&mut self, raw: &[u16]) -> io::Result<bool> {
        match codec::decode(raw) {
            Ok(Decoded::Signal(message)) => self.record(&message).map(|_| true),
            Ok(Decoded::NotASignal) => Ok(false),
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                self.dropped += 1;
                Ok(true)
            },
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
