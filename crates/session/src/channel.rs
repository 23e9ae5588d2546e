use grapple_profile::ChannelEncoding;
use grapple_signal::codec::{self, Marker, TERMINATOR};

/// The one narrow-typed call the scripting environment makes per message.
pub trait NarrowChannel {
    fn call(&mut self, argument: &[u16]);
}

impl<F: FnMut(&[u16])> NarrowChannel for F {
    fn call(&mut self, argument: &[u16]) {
        self(argument)
    }
}

/// Builds the argument the way the script does before handing it to `parseFloat`.
///
/// `Inline` unescapes marker, payload and terminator in one go. `Split` unescapes only the
/// marker and appends the payload as is, the host string's own terminator ends it.
pub fn argument(encoding: ChannelEncoding, marker: Marker, payload: &str) -> Vec<u16> {
    match encoding {
        ChannelEncoding::Inline => codec::unescape(&codec::encode(marker, payload)),
        ChannelEncoding::Split => {
            let mut argument = codec::unescape(&codec::encode_marker(marker));
            argument.extend(payload.encode_utf16());
            argument.push(TERMINATOR);
            argument
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_encodings_produce_the_same_argument() {
        let payload = "<log><message>a = \"%u0041\";</message></log>";

        let inline = argument(ChannelEncoding::Inline, Marker::LogEntry, payload);
        let split = argument(ChannelEncoding::Split, Marker::LogEntry, payload);

        assert_eq!(inline, split);
        assert_eq!(&inline[..2], &[0xC0DE, 0xDEAD]);
        assert_eq!(inline.last(), Some(&TERMINATOR));
    }

    #[test]
    fn closures_are_channels() {
        let mut calls = vec![];
        {
            let mut channel = |argument: &[u16]| calls.push(argument.to_vec());
            NarrowChannel::call(&mut channel, &[1, 2, 0]);
        }

        assert_eq!(calls, vec![vec![1, 2, 0]]);
    }
}
