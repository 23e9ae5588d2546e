/// What a fuzzer logs: one replayable statement or an ordered group of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Statement(String),
    Sequence(Vec<LogMessage>),
}

impl From<&str> for LogMessage {
    fn from(value: &str) -> Self {
        LogMessage::Statement(value.to_string())
    }
}

impl From<String> for LogMessage {
    fn from(value: String) -> Self {
        LogMessage::Statement(value)
    }
}

impl<T: Into<LogMessage>> From<Vec<T>> for LogMessage {
    fn from(value: Vec<T>) -> Self {
        LogMessage::Sequence(value.into_iter().map(Into::into).collect())
    }
}
