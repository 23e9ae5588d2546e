pub mod codec;
pub mod document;
pub mod recorder;
pub mod replay;

pub use codec::{decode, encode, Decoded, DecodeError, Marker, SentinelMessage};
pub use recorder::Recorder;
