//! Input formats the reporter understands.
//!
//! `events` lines are hub events already. `json-stream` lines are what mocha's
//! built-in `json-stream` reporter prints: `["pass", {...}]` tuples, which are
//! mapped onto hub events here.

use clap::ValueEnum;
use ide_mocha_protocol::{
    parse_event_line, ClientEvent, ErrorDetail, ErrorInfo, ReportedStats, TestInfo,
};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum InputFormat {
    /// One hub event per line
    #[default]
    Events,
    /// Output of `mocha --reporter json-stream`
    JsonStream,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MochaTest {
    title: String,
    full_title: Option<String>,
    file: Option<String>,
    duration: Option<u64>,
    err: Option<String>,
    stack: Option<String>,
}

impl MochaTest {
    fn into_test_info(self) -> (TestInfo, Option<String>, Option<String>) {
        (
            TestInfo {
                title: self.title,
                full_title: self.full_title,
                file: self.file,
                duration_ms: self.duration,
            },
            self.err,
            self.stack,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MochaStats {
    tests: Option<u64>,
    duration: Option<u64>,
}

/// Translates one input line. `Ok(None)` means the line carries nothing the
/// hub tracks and should be skipped silently.
pub fn translate_line(format: InputFormat, line: &str) -> Result<Option<ClientEvent>, ErrorInfo> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match format {
        InputFormat::Events => parse_event_line(trimmed.as_bytes()).map(Some),
        InputFormat::JsonStream => translate_json_stream(trimmed),
    }
}

fn translate_json_stream(line: &str) -> Result<Option<ClientEvent>, ErrorInfo> {
    let (kind, payload): (String, serde_json::Value) = serde_json::from_str(line)
        .map_err(|err| ErrorInfo::new("invalid_json", format!("Invalid json-stream line: {}", err)))?;

    let event = match kind.as_str() {
        "start" => ClientEvent::start(),
        "pass" => ClientEvent::pass(mocha_test(payload)?.into_test_info().0),
        "pending" => ClientEvent::pending(mocha_test(payload)?.into_test_info().0),
        "fail" => {
            let (test, err, stack) = mocha_test(payload)?.into_test_info();
            let message = err
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| "Test failed".to_string());
            ClientEvent::fail(
                test,
                ErrorDetail {
                    message,
                    stack,
                    ..ErrorDetail::default()
                },
            )
        }
        "end" => {
            let stats: MochaStats = serde_json::from_value(payload).unwrap_or_default();
            let mut event = ClientEvent::end(stats.duration);
            event.stats = Some(ReportedStats {
                duration_ms: stats.duration,
                tests: stats.tests,
            });
            event
        }
        _ => return Ok(None),
    };

    event.validate()?;
    Ok(Some(event))
}

fn mocha_test(payload: serde_json::Value) -> Result<MochaTest, ErrorInfo> {
    serde_json::from_value(payload)
        .map_err(|err| ErrorInfo::new("invalid_event", format!("Invalid test payload: {}", err)))
}
