use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Hosting environment a session runs in. Closed set; anything unrecognized is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentTag {
    #[serde(rename = "FF")]
    Firefox,
    #[serde(rename = "IE")]
    InternetExplorer,
    #[serde(rename = "CM")]
    Chrome,
    #[serde(rename = "SF")]
    Safari,
    #[serde(rename = "OP")]
    Opera,
    #[serde(rename = "??")]
    Unknown,
}

impl EnvironmentTag {
    pub fn code(&self) -> &'static str {
        match self {
            EnvironmentTag::Firefox => "FF",
            EnvironmentTag::InternetExplorer => "IE",
            EnvironmentTag::Chrome => "CM",
            EnvironmentTag::Safari => "SF",
            EnvironmentTag::Opera => "OP",
            EnvironmentTag::Unknown => "??",
        }
    }
}

impl fmt::Display for EnvironmentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// How a message is put on the narrow channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelEncoding {
    /// Marker, payload and an explicit terminator go through a single `unescape()` literal.
    Inline,
    /// The marker is unescaped by its own call and concatenated with the raw payload; the
    /// host string's own NUL terminates the argument.
    #[default]
    Split,
}

// Order matters: Chrome user agents also mention Safari.
const CLASSIFIERS: &[(&str, EnvironmentTag)] = &[
    (r"Firefox[/\s](\d+\.\d+)", EnvironmentTag::Firefox),
    (r"MSIE (\d+\.\d+);", EnvironmentTag::InternetExplorer),
    (r"Chrome", EnvironmentTag::Chrome),
    (r"Safari", EnvironmentTag::Safari),
    (r"Opera", EnvironmentTag::Opera),
];

fn classifiers() -> &'static [(Regex, EnvironmentTag)] {
    static COMPILED: OnceLock<Vec<(Regex, EnvironmentTag)>> = OnceLock::new();

    COMPILED.get_or_init(|| {
        CLASSIFIERS.iter()
            .filter_map(|(pattern, tag)| Regex::new(pattern).ok().map(|r| (r, *tag)))
            .collect()
    })
}

/// Maps an identifying string (a user agent) onto the closed tag set.
pub fn classify(identifier: &str) -> EnvironmentTag {
    classifiers()
        .iter()
        .find(|(pattern, _)| pattern.is_match(identifier))
        .map(|(_, tag)| *tag)
        .unwrap_or(EnvironmentTag::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn we_can_classify_common_user_agents() {
        let cases = [
            ("Mozilla/5.0 (Windows NT 6.1; rv:15.0) Gecko/20100101 Firefox/15.0.1", EnvironmentTag::Firefox),
            ("Mozilla/5.0 (compatible; MSIE 9.0; Windows NT 6.1; Trident/5.0)", EnvironmentTag::InternetExplorer),
            (
                "Mozilla/5.0 (Windows NT 6.1) AppleWebKit/537.1 (KHTML, like Gecko) Chrome/21.0.1180.89 Safari/537.1",
                EnvironmentTag::Chrome,
            ),
            (
                "Mozilla/5.0 (Windows NT 6.1) AppleWebKit/534.57.2 (KHTML, like Gecko) Version/5.1.7 Safari/534.57.2",
                EnvironmentTag::Safari,
            ),
            ("Opera/9.80 (Windows NT 6.1; U; en) Presto/2.10.289 Version/12.02", EnvironmentTag::Opera),
        ];

        for (agent, expected) in cases {
            assert_eq!(classify(agent), expected, "Misclassified {}", agent);
        }
    }

    #[test]
    fn unmatched_identifiers_are_unknown() {
        assert_eq!(classify(""), EnvironmentTag::Unknown);
        assert_eq!(classify("curl/7.29.0"), EnvironmentTag::Unknown);
        assert_eq!(classify("Firefox without a version"), EnvironmentTag::Unknown);
    }

    #[test]
    fn tags_render_as_their_short_codes() {
        assert_eq!(EnvironmentTag::Chrome.to_string(), "CM");
        assert_eq!(EnvironmentTag::Unknown.to_string(), "??");
    }
}
