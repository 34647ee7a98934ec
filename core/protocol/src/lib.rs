//! Wire protocol shared by the ide-mocha hub and the reporters that feed it.
//!
//! A reporter streams one JSON object per line into the endpoint owned by its
//! project folder. This crate is used on both ends of that socket so the event
//! schema and the endpoint derivation cannot drift apart.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

pub mod address;

pub use address::{allocate, AddressError, Endpoint, InterfaceMode};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_EVENT_BYTES: usize = 1024 * 1024; // 1MB
pub const ADDRESS_ENV: &str = "IDE_MOCHA_ADDRESS";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Event names follow the test framework's runner events verbatim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "suite")]
    Suite,
    #[serde(rename = "suite end")]
    SuiteEnd,
    #[serde(rename = "test end")]
    TestEnd,
    #[serde(rename = "pass")]
    Pass,
    #[serde(rename = "fail")]
    Fail,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "end")]
    End,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Suite => "suite",
            EventKind::SuiteEnd => "suite end",
            EventKind::TestEnd => "test end",
            EventKind::Pass => "pass",
            EventKind::Fail => "fail",
            EventKind::Pending => "pending",
            EventKind::End => "end",
        }
    }

    fn requires_test(&self) -> bool {
        matches!(
            self,
            EventKind::TestEnd | EventKind::Pass | EventKind::Fail | EventKind::Pending
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuiteInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestInfo {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TestInfo {
    pub fn named(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn display_title(&self) -> &str {
        self.full_title.as_deref().unwrap_or(&self.title)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

/// Totals as the reporter saw them when the run ended. Only `duration_ms` is
/// authoritative; the hub counts passes and failures itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportedStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<u64>,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientEvent {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<SuiteInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReportedStats>,
}

impl ClientEvent {
    fn bare(event: EventKind) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            event,
            sent_at: None,
            suite: None,
            test: None,
            error: None,
            stats: None,
        }
    }

    pub fn start() -> Self {
        Self::bare(EventKind::Start)
    }

    pub fn suite(title: impl Into<String>) -> Self {
        Self {
            suite: Some(SuiteInfo {
                title: title.into(),
                file: None,
            }),
            ..Self::bare(EventKind::Suite)
        }
    }

    pub fn suite_end(title: impl Into<String>) -> Self {
        Self {
            suite: Some(SuiteInfo {
                title: title.into(),
                file: None,
            }),
            ..Self::bare(EventKind::SuiteEnd)
        }
    }

    pub fn test_end(test: TestInfo) -> Self {
        Self {
            test: Some(test),
            ..Self::bare(EventKind::TestEnd)
        }
    }

    pub fn pass(test: TestInfo) -> Self {
        Self {
            test: Some(test),
            ..Self::bare(EventKind::Pass)
        }
    }

    pub fn fail(test: TestInfo, error: ErrorDetail) -> Self {
        Self {
            test: Some(test),
            error: Some(error),
            ..Self::bare(EventKind::Fail)
        }
    }

    pub fn pending(test: TestInfo) -> Self {
        Self {
            test: Some(test),
            ..Self::bare(EventKind::Pending)
        }
    }

    pub fn end(duration_ms: Option<u64>) -> Self {
        Self {
            stats: Some(ReportedStats {
                duration_ms,
                tests: None,
            }),
            ..Self::bare(EventKind::End)
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ErrorInfo::new(
                "protocol_mismatch",
                format!("unsupported protocol version {}", self.protocol_version),
            ));
        }

        if let Some(sent_at) = self.sent_at.as_deref() {
            if DateTime::parse_from_rfc3339(sent_at).is_err() {
                return Err(ErrorInfo::new("invalid_timestamp", "sent_at must be RFC3339"));
            }
        }

        match self.event {
            // The root suite has an empty title, so only presence is checked.
            EventKind::Suite | EventKind::SuiteEnd => {
                if self.suite.is_none() {
                    return Err(ErrorInfo::new("missing_field", "suite is required"));
                }
            }
            kind if kind.requires_test() => {
                let test = self
                    .test
                    .as_ref()
                    .ok_or_else(|| ErrorInfo::new("missing_field", "test is required"))?;
                require_string(&test.title, "test.title")?;
                if kind == EventKind::Fail {
                    let error = self
                        .error
                        .as_ref()
                        .ok_or_else(|| ErrorInfo::new("missing_field", "error is required"))?;
                    require_string(&error.message, "error.message")?;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Decodes and validates one framed line. Surrounding whitespace, including the
/// trailing newline, is ignored.
pub fn parse_event_line(line: &[u8]) -> Result<ClientEvent, ErrorInfo> {
    let trimmed = trim_ascii_whitespace(line);
    if trimmed.is_empty() {
        return Err(ErrorInfo::new("empty_event", "event line was empty"));
    }
    if trimmed.len() > MAX_EVENT_BYTES {
        return Err(ErrorInfo::new(
            "event_too_large",
            "event exceeded maximum size",
        ));
    }

    let event: ClientEvent = serde_json::from_slice(trimmed).map_err(|err| {
        ErrorInfo::new("invalid_json", format!("event was not valid JSON: {}", err))
    })?;
    event.validate()?;
    Ok(event)
}

/// Serializes an event as a single newline-terminated line.
pub fn encode_event_line(event: &ClientEvent) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    Ok(line)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|index| index + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

fn require_string(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> ClientEvent {
        ClientEvent::fail(
            TestInfo::named("adds numbers"),
            ErrorDetail {
                message: "expected 2 to equal 3".to_string(),
                ..ErrorDetail::default()
            },
        )
    }

    #[test]
    fn parses_event_names_with_spaces() {
        let event = parse_event_line(br#"{"event":"test end","test":{"title":"a"}}"#)
            .expect("parse test end");
        assert_eq!(event.event, EventKind::TestEnd);
        assert_eq!(event.protocol_version, PROTOCOL_VERSION);

        let event = parse_event_line(b"{\"event\":\"suite end\",\"suite\":{\"title\":\"\"}}\n")
            .expect("parse suite end");
        assert_eq!(event.event, EventKind::SuiteEnd);
    }

    #[test]
    fn encoded_line_is_newline_terminated_and_parses_back() {
        let line = encode_event_line(&failing()).expect("encode");
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(
            line.iter().filter(|b| **b == b'\n').count(),
            1,
            "exactly one frame delimiter"
        );
        assert_eq!(parse_event_line(&line).expect("parse"), failing());
    }

    #[test]
    fn fail_requires_error_message() {
        let mut event = failing();
        event.error = None;
        assert_eq!(event.validate().unwrap_err().code, "missing_field");

        let mut event = failing();
        event.error = Some(ErrorDetail::default());
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_events_require_title() {
        let event = ClientEvent::pass(TestInfo::named("  "));
        assert!(event.validate().is_err());

        let mut event = ClientEvent::pending(TestInfo::named("todo"));
        event.test = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn suite_allows_empty_root_title() {
        assert!(ClientEvent::suite("").validate().is_ok());
        let mut event = ClientEvent::suite("math");
        event.suite = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let mut event = ClientEvent::start();
        event.protocol_version = 7;
        assert_eq!(event.validate().unwrap_err().code, "protocol_mismatch");
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut event = ClientEvent::start();
        event.sent_at = Some("yesterday".to_string());
        assert_eq!(event.validate().unwrap_err().code, "invalid_timestamp");

        event.sent_at = Some("2026-01-30T12:00:00Z".to_string());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_fields_and_empty_lines() {
        let err = parse_event_line(br#"{"event":"start","bogus":1}"#).unwrap_err();
        assert_eq!(err.code, "invalid_json");

        let err = parse_event_line(b"   \n").unwrap_err();
        assert_eq!(err.code, "empty_event");

        let err = parse_event_line(br#"{"event":"restart"}"#).unwrap_err();
        assert_eq!(err.code, "invalid_json");
    }
}
