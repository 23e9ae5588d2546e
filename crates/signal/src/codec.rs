//! Wire shape of sentinel messages smuggled through `parseFloat`.
//!
//! A message is the marker word (low half first, as two UTF-16 units), the payload units
//! and a terminating `0x0000` unit. On the script side the whole thing is written as an
//! escaped literal that `unescape()` turns into the raw argument; the dispatch code in the
//! trampoline and [`decode`] only ever look at the raw argument.

use std::fmt;
use serde::{Deserialize, Serialize};

pub const TERMINATOR: u16 = 0x0000;

/// Upper bound used when walking a payload out of raw memory.
pub const DEFAULT_LENGTH_GUARD: usize = 0x10_0000;

/// Reserved tags. Every marker has `0xDEAD` as its high unit, a lone surrogate that no
/// numeric literal (or any well-formed text) starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Marker {
    SessionOpen,
    LogEntry,
    TestComplete,
}

impl Marker {
    pub const ALL: [Marker; 3] = [Marker::SessionOpen, Marker::LogEntry, Marker::TestComplete];

    pub fn word(self) -> u32 {
        match self {
            Marker::SessionOpen => 0xDEADBEEF,
            Marker::LogEntry => 0xDEADC0DE,
            Marker::TestComplete => 0xDEADF00D,
        }
    }

    pub fn from_word(word: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.word() == word)
    }

    /// The marker as it appears in the argument buffer, low unit first.
    pub fn units(self) -> [u16; 2] {
        let word = self.word();
        [(word & 0xFFFF) as u16, (word >> 16) as u16]
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#010x})", self, self.word())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelMessage {
    pub marker: Marker,
    pub payload: String,
}

impl SentinelMessage {
    pub fn new(marker: Marker, payload: impl Into<String>) -> Self {
        Self { marker, payload: payload.into() }
    }

    /// Raw argument units: marker, payload, terminator.
    pub fn to_units(&self) -> Vec<u16> {
        let mut units = Vec::with_capacity(self.payload.len() + 3);
        units.extend_from_slice(&self.marker.units());
        units.extend(self.payload.encode_utf16());
        units.push(TERMINATOR);
        units
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Signal(SentinelMessage),
    NotASignal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Unterminated { marker: Marker, length: usize },
    InvalidUtf16 { marker: Marker },
    NullPayload,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Unterminated { marker, length } => {
                write!(f, "{} payload has no terminator within {} units", marker, length)
            },
            DecodeError::InvalidUtf16 { marker } => write!(f, "{} payload is not valid UTF-16", marker),
            DecodeError::NullPayload => write!(f, "payload pointer is null"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Classifies a raw argument by its leading word only.
pub fn decode(raw: &[u16]) -> Result<Decoded, DecodeError> {
    if raw.len() < 2 {
        return Ok(Decoded::NotASignal);
    }

    let word = raw[0] as u32 | (raw[1] as u32) << 16;
    match Marker::from_word(word) {
        Some(marker) => decode_payload(marker, &raw[2..]).map(Decoded::Signal),
        None => Ok(Decoded::NotASignal),
    }
}

/// Reconstructs the payload that follows an already-recognized marker.
pub fn decode_payload(marker: Marker, units: &[u16]) -> Result<SentinelMessage, DecodeError> {
    let end = units.iter()
        .position(|u| *u == TERMINATOR)
        .ok_or(DecodeError::Unterminated { marker, length: units.len() })?;

    let payload = String::from_utf16(&units[..end])
        .map_err(|_| DecodeError::InvalidUtf16 { marker })?;

    Ok(SentinelMessage { marker, payload })
}

/// Escaped literal for a complete message, e.g. `%uC0DE%uDEAD%3Clog%3E...%u0000`.
pub fn encode(marker: Marker, payload: &str) -> String {
    let mut literal = encode_marker(marker);
    literal.push_str(&escape(payload));
    literal.push_str("%u0000");
    literal
}

/// Escaped literal for the marker alone.
pub fn encode_marker(marker: Marker) -> String {
    let [low, high] = marker.units();
    format!("%u{:04X}%u{:04X}", low, high)
}

/// `escape()` as script runtimes implement it.
pub fn escape(text: &str) -> String {
    let mut result = String::with_capacity(text.len());

    for unit in text.encode_utf16() {
        match char::from_u32(unit as u32) {
            Some(c) if c.is_ascii_alphanumeric() || "@*_+-./".contains(c) => result.push(c),
            _ if unit < 0x100 => result.push_str(&format!("%{:02X}", unit)),
            _ => result.push_str(&format!("%u{:04X}", unit)),
        }
    }

    result
}

/// `unescape()` as script runtimes implement it. Malformed escapes stay literal.
pub fn unescape(literal: &str) -> Vec<u16> {
    let units = literal.encode_utf16().collect::<Vec<u16>>();
    let mut result = Vec::with_capacity(units.len());
    let mut position = 0;

    while position < units.len() {
        let unit = units[position];

        if unit == '%' as u16 {
            if units.get(position + 1) == Some(&('u' as u16)) {
                if let Some(value) = parse_hex(units.get(position + 2..position + 6)) {
                    result.push(value);
                    position += 6;
                    continue;
                }
            } else if let Some(value) = parse_hex(units.get(position + 1..position + 3)) {
                result.push(value);
                position += 3;
                continue;
            }
        }

        result.push(unit);
        position += 1;
    }

    result
}

fn parse_hex(digits: Option<&[u16]>) -> Option<u16> {
    let digits = String::from_utf16(digits?).ok()?;
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    u16::from_str_radix(&digits, 16).ok()
}

/// Copies a NUL-terminated unit string out of raw memory.
///
/// # Safety
/// `payload` must be null or point to readable memory up to either a terminator or
/// `guard` units, whichever comes first.
pub unsafe fn read_terminated(marker: Marker, payload: *const u16, guard: usize) -> Result<Vec<u16>, DecodeError> {
    if payload.is_null() {
        return Err(DecodeError::NullPayload);
    }

    let mut units = Vec::new();
    for offset in 0..guard {
        let unit = *payload.add(offset);
        if unit == TERMINATOR {
            units.push(unit);
            return Ok(units);
        }

        units.push(unit);
    }

    Err(DecodeError::Unterminated { marker, length: guard })
}
