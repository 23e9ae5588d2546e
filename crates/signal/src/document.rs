//! Fragments of the log document. Every fragment is emitted as one channel message, so a
//! document is the concatenation of payloads in call order.

use quick_xml::escape::escape;

pub const SESSION_CLOSE: &str = "</fuzzer>";
pub const SEQUENCE_CLOSE: &str = "</log>";

/// Script escape standing in for U+0000, which would end the message on the channel and
/// has no XML 1.0 representation either.
pub const NUL_ESCAPE: &str = "\\u0000";

fn text(value: &str) -> String {
    escape(value).replace('\0', NUL_ESCAPE)
}

pub fn session_open(name: &str, browser: &str) -> String {
    format!("<fuzzer name=\"{}\" browser=\"{}\">", text(name), text(browser))
}

pub fn statement(index: usize, location: &str, message: &str, count: u32) -> String {
    format!(
        "<log><idx>{}</idx><location>{}</location><message>{}</message><count>{}</count></log>",
        index,
        text(location),
        text(message),
        count
    )
}

pub fn sequence_open(index: usize, location: &str, count: u32) -> String {
    format!(
        "<log><idx>{}</idx><location>{}</location><count>{}</count>",
        index,
        text(location),
        count
    )
}
