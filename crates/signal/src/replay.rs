//! Turns a recorded log document back into records and a runnable testcase.

use std::fmt;
use std::fmt::Write;

use log::warn;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Statement(String),
    Sequence(Vec<LogRecord>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub index: usize,
    pub location: String,
    pub count: u32,
    pub body: RecordBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuzzerLog {
    pub name: String,
    pub browser: String,
    pub records: Vec<LogRecord>,
    /// Set when the document ended before `</fuzzer>`, which is what a crash looks like.
    pub truncated: bool,
}

#[derive(Debug)]
pub enum ReplayError {
    MissingSessionHeader,
    Xml(String),
    InvalidNumber { field: &'static str, value: String },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::MissingSessionHeader => write!(f, "document does not start with a <fuzzer> element"),
            ReplayError::Xml(e) => write!(f, "malformed document: {}", e),
            ReplayError::InvalidNumber { field, value } => write!(f, "<{}> holds {:?}, expected a number", field, value),
        }
    }
}

impl std::error::Error for ReplayError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Index,
    Location,
    Message,
    Count,
}

#[derive(Default)]
struct Frame {
    index: Option<usize>,
    location: String,
    message: Option<String>,
    count: Option<u32>,
    children: Vec<LogRecord>,
}

impl Frame {
    fn into_record(self) -> Option<LogRecord> {
        let body = match self.message {
            Some(message) => RecordBody::Statement(message),
            None => RecordBody::Sequence(self.children),
        };

        Some(LogRecord {
            index: self.index?,
            location: self.location,
            count: self.count.unwrap_or(1),
            body,
        })
    }
}

pub fn parse_document(text: &str) -> Result<FuzzerLog, ReplayError> {
    let mut reader = Reader::from_str(text);
    let mut result = FuzzerLog::default();
    let mut seen_header = false;
    let mut closed = false;
    let mut frames: Vec<Frame> = Vec::new();
    let mut field: Option<Field> = None;

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) if seen_header => {
                warn!("Document cut off at byte {}: {}", reader.buffer_position(), e);
                break;
            },
            Err(e) => return Err(ReplayError::Xml(e.to_string())),
        };

        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"fuzzer" => {
                    result.name = attribute(&e, "name")?;
                    result.browser = attribute(&e, "browser")?;
                    seen_header = true;
                },
                b"log" => frames.push(Frame::default()),
                other => {
                    field = field_of(other);
                    if field == Some(Field::Message) {
                        if let Some(frame) = frames.last_mut() {
                            frame.message = Some(String::new());
                        }
                    }
                },
            },
            Event::Empty(e) => {
                if field_of(e.name().as_ref()) == Some(Field::Message) {
                    if let Some(frame) = frames.last_mut() {
                        frame.message = Some(String::new());
                    }
                }
            },
            Event::Text(e) => {
                let (Some(current), Some(frame)) = (field, frames.last_mut()) else {
                    continue;
                };

                let value = e.unescape().map_err(|e| ReplayError::Xml(e.to_string()))?;
                apply_field(frame, current, &value)?;
            },
            Event::End(e) => match e.name().as_ref() {
                b"log" => {
                    let record = frames.pop().and_then(Frame::into_record);
                    push_record(&mut frames, &mut result.records, record);
                },
                b"fuzzer" => closed = true,
                _ => field = None,
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if !seen_header {
        return Err(ReplayError::MissingSessionHeader);
    }

    // Whatever was still open when the target died is kept as far as it got.
    while let Some(frame) = frames.pop() {
        let record = frame.into_record();
        push_record(&mut frames, &mut result.records, record);
    }

    result.truncated = !closed;
    Ok(result)
}

fn field_of(name: &[u8]) -> Option<Field> {
    match name {
        b"idx" => Some(Field::Index),
        b"location" => Some(Field::Location),
        b"message" => Some(Field::Message),
        b"count" => Some(Field::Count),
        _ => None,
    }
}

fn apply_field(frame: &mut Frame, field: Field, value: &str) -> Result<(), ReplayError> {
    match field {
        Field::Index => {
            frame.index = Some(parse_number("idx", value)?);
        },
        Field::Count => {
            frame.count = Some(parse_number("count", value)?);
        },
        Field::Location => frame.location.push_str(value),
        Field::Message => frame.message.get_or_insert_with(String::new).push_str(value),
    }

    Ok(())
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ReplayError> {
    value.trim()
        .parse::<T>()
        .map_err(|_| ReplayError::InvalidNumber { field, value: value.to_string() })
}

fn push_record(frames: &mut [Frame], records: &mut Vec<LogRecord>, record: Option<LogRecord>) {
    let Some(record) = record else {
        return;
    };

    match frames.last_mut() {
        Some(parent) => parent.children.push(record),
        None => records.push(record),
    }
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<String, ReplayError> {
    let attribute = element.try_get_attribute(name)
        .map_err(|e| ReplayError::Xml(e.to_string()))?;

    match attribute {
        Some(attribute) => attribute.unescape_value()
            .map(|v| v.into_owned())
            .map_err(|e| ReplayError::Xml(e.to_string())),
        None => Ok(String::new()),
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Wrap every executable statement in `try { } catch(e) {}`.
    pub try_catch: bool,
    /// Turn `/* ... */` statements into live code.
    pub uncomment: bool,
    pub indent: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            try_catch: false,
            uncomment: false,
            indent: "\t".to_string(),
        }
    }
}

pub fn render_testcase(log: &FuzzerLog, options: &RenderOptions) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "// {} ({})", log.name, log.browser);
    if log.truncated {
        let _ = writeln!(output, "// log ends without </fuzzer>, last statement is the likely trigger");
    }

    for record in log.records.iter() {
        render_record(&mut output, record, options, 0);
    }

    output
}

fn render_record(output: &mut String, record: &LogRecord, options: &RenderOptions, depth: usize) {
    let repeated = record.count > 1;
    let inner_depth = if repeated { depth + 1 } else { depth };

    if repeated {
        let counter = if depth == 0 { "i".to_string() } else { format!("i{}", depth) };
        let _ = writeln!(
            output,
            "{}for( {c}=0 ; {c}<{} ; {c}++ ) {{",
            options.indent.repeat(depth),
            record.count,
            c = counter
        );
    }

    match &record.body {
        RecordBody::Statement(message) => {
            let line = render_statement(message, options);
            let _ = writeln!(output, "{}{}", options.indent.repeat(inner_depth), line);
        },
        RecordBody::Sequence(children) => {
            for child in children.iter() {
                render_record(output, child, options, inner_depth);
            }
        },
    }

    if repeated {
        let _ = writeln!(output, "{}}}", options.indent.repeat(depth));
    }
}

fn render_statement(message: &str, options: &RenderOptions) -> String {
    let trimmed = message.trim();

    if trimmed.starts_with("//") {
        return trimmed.to_string();
    }

    let is_block_comment = trimmed.starts_with("/*") && trimmed.ends_with("*/") && trimmed.len() >= 4;
    if is_block_comment && !options.uncomment {
        return trimmed.to_string();
    }

    let code = if is_block_comment {
        trimmed[2..trimmed.len() - 2].trim()
    } else {
        trimmed
    };

    if options.try_catch {
        format!("try {{ {} }} catch(e) {{}}", code)
    } else {
        code.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = "<fuzzer name=\"demo\" browser=\"CM\">\n\
        <log><idx>0</idx><location>phase1</location><message>x_0.value = &apos;AAAA&apos;;</message><count>1</count></log>\n\
        <log><idx>1</idx><location>phase1</location><count>1</count>\n\
        <log><idx>2</idx><location>phase1</location><message>/* check(x_0); */</message><count>1</count></log>\n\
        </log>\n\
        <log><idx>3</idx><location></location><message>x_0.click();</message><count>4</count></log>\n\
        </fuzzer>\n";

    #[test]
    fn we_can_parse_a_complete_document() {
        let log = parse_document(DOCUMENT).unwrap();

        assert_eq!(log.name, "demo");
        assert_eq!(log.browser, "CM");
        assert!(!log.truncated);
        assert_eq!(log.records.len(), 3);
        assert_eq!(log.records[0].body, RecordBody::Statement("x_0.value = 'AAAA';".to_string()));
        assert_eq!(log.records[1].index, 1);
        assert_eq!(
            log.records[1].body,
            RecordBody::Sequence(vec![LogRecord {
                index: 2,
                location: "phase1".to_string(),
                count: 1,
                body: RecordBody::Statement("/* check(x_0); */".to_string()),
            }])
        );
        assert_eq!(log.records[2].count, 4);
        assert_eq!(log.records[2].location, "");
    }

    #[test]
    fn we_can_parse_a_document_cut_off_by_a_crash() {
        let text = "<fuzzer name=\"demo\" browser=\"FF\">\n\
            <log><idx>0</idx><location>a</location><count>2</count>\n\
            <log><idx>1</idx><location>a</location><message>boom();</message><count>1</count></log>\n";
        let log = parse_document(text).unwrap();

        assert!(log.truncated);
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.records[0].count, 2);
        assert!(matches!(&log.records[0].body, RecordBody::Sequence(children) if children.len() == 1));
    }

    #[test]
    fn documents_without_a_header_are_rejected() {
        assert!(matches!(parse_document("<log></log>"), Err(ReplayError::MissingSessionHeader)));
    }

    #[test]
    fn bad_numbers_are_reported() {
        let text = "<fuzzer name=\"a\" browser=\"b\"><log><idx>x</idx></log></fuzzer>";

        assert!(matches!(parse_document(text), Err(ReplayError::InvalidNumber { field: "idx", .. })));
    }

    #[test]
    fn we_can_render_a_testcase() {
        let log = parse_document(DOCUMENT).unwrap();
        let testcase = render_testcase(&log, &RenderOptions::default());

        assert_eq!(
            testcase,
            "// demo (CM)\n\
             x_0.value = 'AAAA';\n\
             /* check(x_0); */\n\
             for( i=0 ; i<4 ; i++ ) {\n\
             \tx_0.click();\n\
             }\n"
        );
    }

    #[test]
    fn we_can_render_with_try_catch_and_uncommented_calls() {
        let log = parse_document(DOCUMENT).unwrap();
        let options = RenderOptions { try_catch: true, uncomment: true, ..RenderOptions::default() };
        let testcase = render_testcase(&log, &options);

        assert!(testcase.contains("try { check(x_0); } catch(e) {}\n"));
        assert!(testcase.contains("try { x_0.value = 'AAAA'; } catch(e) {}\n"));
    }

    #[test]
    fn line_comments_are_never_uncommented() {
        let options = RenderOptions { try_catch: true, uncomment: true, ..RenderOptions::default() };

        assert_eq!(render_statement("// note to self", &options), "// note to self");
    }
}
