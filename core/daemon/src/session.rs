//! Per-connection run aggregation.
//!
//! A `Session` turns the ordered event stream of one reporter connection into
//! progress signals and exactly one terminal `Closed` signal. It is a plain
//! reducer with no I/O; the connection task feeds it and dispatches whatever it
//! returns.
//!
//! Streams are not trusted to be well formed. Test or suite events before
//! `start` imply a start, a second `start` is ignored, and anything after the
//! session closed is dropped.

use chrono::{DateTime, Utc};
use ide_mocha_protocol::{ClientEvent, ErrorDetail, EventKind, TestInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub passes: u64,
    pub failures: u64,
    pub pending: u64,
    pub duration_ms: u64,
}

/// How a run ended. `Aborted` means the connection went away before the
/// reporter sent `end`, whatever the failure count was at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Passed,
    Failed,
    Aborted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Passed => "passed",
            RunOutcome::Failed => "failed",
            RunOutcome::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    RunStarted,
    SuiteStarted { title: String, depth: usize },
    SuiteEnded { title: String, depth: usize },
    TestEnded { test: TestInfo },
    TestPassed { test: TestInfo },
    TestFailed { test: TestInfo, error: ErrorDetail },
    TestPending { test: TestInfo },
    Closed { stats: RunStats, outcome: RunOutcome },
}

impl SessionSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionSignal::Closed { .. })
    }
}

#[derive(Debug)]
pub struct Session {
    folder: PathBuf,
    phase: SessionPhase,
    stats: RunStats,
    suite_depth: usize,
    tests_ended: u64,
    started_at: Option<Instant>,
    last_event_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(folder: PathBuf) -> Self {
        Self {
            folder,
            phase: SessionPhase::Idle,
            stats: RunStats::default(),
            suite_depth: 0,
            tests_ended: 0,
            started_at: None,
            last_event_at: None,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn suite_depth(&self) -> usize {
        self.suite_depth
    }

    pub fn tests_ended(&self) -> u64 {
        self.tests_ended
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    pub fn apply(&mut self, event: ClientEvent) -> Vec<SessionSignal> {
        if self.is_closed() {
            debug!(
                folder = %self.folder.display(),
                event = event.event.as_str(),
                "Ignoring event after session closed"
            );
            return Vec::new();
        }

        self.last_event_at = Some(
            event
                .sent_at
                .as_deref()
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        );

        let mut signals = Vec::new();
        match event.event {
            EventKind::Start => {
                if self.phase == SessionPhase::Running {
                    debug!(folder = %self.folder.display(), "Ignoring repeated start");
                } else {
                    self.begin_run(&mut signals);
                }
            }
            EventKind::End => {
                let reported = event.stats.and_then(|stats| stats.duration_ms);
                self.stats.duration_ms = reported.unwrap_or_else(|| self.elapsed_ms());
                let outcome = if self.stats.failures > 0 {
                    RunOutcome::Failed
                } else {
                    RunOutcome::Passed
                };
                signals.push(self.finish(outcome));
            }
            kind => {
                if self.phase == SessionPhase::Idle {
                    debug!(
                        folder = %self.folder.display(),
                        event = kind.as_str(),
                        "Event before start; starting run implicitly"
                    );
                    self.begin_run(&mut signals);
                }
                if let Some(signal) = self.progress(kind, event) {
                    signals.push(signal);
                }
            }
        }
        signals
    }

    /// The connection went away or was torn down. Returns the terminal signal
    /// unless one was already produced.
    pub fn close(&mut self) -> Option<SessionSignal> {
        if self.is_closed() {
            return None;
        }
        self.stats.duration_ms = self.elapsed_ms();
        Some(self.finish(RunOutcome::Aborted))
    }

    fn begin_run(&mut self, signals: &mut Vec<SessionSignal>) {
        self.phase = SessionPhase::Running;
        self.stats = RunStats::default();
        self.suite_depth = 0;
        self.tests_ended = 0;
        self.started_at = Some(Instant::now());
        signals.push(SessionSignal::RunStarted);
    }

    fn progress(&mut self, kind: EventKind, event: ClientEvent) -> Option<SessionSignal> {
        let test = event.test;
        match kind {
            EventKind::Suite => {
                self.suite_depth += 1;
                Some(SessionSignal::SuiteStarted {
                    title: event.suite.map(|suite| suite.title).unwrap_or_default(),
                    depth: self.suite_depth,
                })
            }
            EventKind::SuiteEnd => {
                let depth = self.suite_depth;
                self.suite_depth = self.suite_depth.saturating_sub(1);
                Some(SessionSignal::SuiteEnded {
                    title: event.suite.map(|suite| suite.title).unwrap_or_default(),
                    depth,
                })
            }
            EventKind::TestEnd => {
                self.tests_ended += 1;
                Some(SessionSignal::TestEnded {
                    test: test.unwrap_or_default(),
                })
            }
            EventKind::Pass => {
                self.stats.passes += 1;
                Some(SessionSignal::TestPassed {
                    test: test.unwrap_or_default(),
                })
            }
            EventKind::Fail => {
                self.stats.failures += 1;
                Some(SessionSignal::TestFailed {
                    test: test.unwrap_or_default(),
                    error: event.error.unwrap_or_default(),
                })
            }
            EventKind::Pending => {
                self.stats.pending += 1;
                Some(SessionSignal::TestPending {
                    test: test.unwrap_or_default(),
                })
            }
            EventKind::Start | EventKind::End => None,
        }
    }

    fn finish(&mut self, outcome: RunOutcome) -> SessionSignal {
        self.phase = SessionPhase::Closed;
        SessionSignal::Closed {
            stats: self.stats,
            outcome,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(PathBuf::from("/work/app"))
    }

    fn failure(message: &str) -> ErrorDetail {
        ErrorDetail {
            message: message.to_string(),
            ..ErrorDetail::default()
        }
    }

    fn feed(session: &mut Session, events: Vec<ClientEvent>) -> Vec<SessionSignal> {
        events
            .into_iter()
            .flat_map(|event| session.apply(event))
            .collect()
    }

    fn terminals(signals: &[SessionSignal]) -> Vec<&SessionSignal> {
        signals.iter().filter(|signal| signal.is_terminal()).collect()
    }

    #[test]
    fn well_formed_run_closes_once_with_counts() {
        let mut session = session();
        let mut signals = feed(
            &mut session,
            vec![
                ClientEvent::start(),
                ClientEvent::pass(TestInfo::named("a")),
                ClientEvent::pass(TestInfo::named("b")),
                ClientEvent::fail(TestInfo::named("c"), failure("boom")),
                ClientEvent::end(Some(42)),
            ],
        );
        signals.extend(session.close());

        assert_eq!(signals.first(), Some(&SessionSignal::RunStarted));
        assert_eq!(
            terminals(&signals),
            vec![&SessionSignal::Closed {
                stats: RunStats {
                    passes: 2,
                    failures: 1,
                    pending: 0,
                    duration_ms: 42,
                },
                outcome: RunOutcome::Failed,
            }]
        );
        assert!(session.is_closed());
    }

    #[test]
    fn abrupt_close_after_progress_is_aborted() {
        let mut session = session();
        feed(
            &mut session,
            vec![ClientEvent::start(), ClientEvent::pass(TestInfo::named("a"))],
        );

        let signal = session.close().expect("terminal signal");
        match signal {
            SessionSignal::Closed { stats, outcome } => {
                assert_eq!(outcome, RunOutcome::Aborted);
                assert_eq!(stats.passes, 1);
                assert_eq!(stats.failures, 0);
            }
            other => panic!("unexpected signal {:?}", other),
        }
        assert_eq!(session.close(), None);
    }

    #[test]
    fn clean_end_without_failures_passes() {
        let mut session = session();
        let signals = feed(
            &mut session,
            vec![
                ClientEvent::start(),
                ClientEvent::pending(TestInfo::named("later")),
                ClientEvent::end(None),
            ],
        );
        assert!(matches!(
            signals.last(),
            Some(SessionSignal::Closed {
                outcome: RunOutcome::Passed,
                stats: RunStats { pending: 1, .. },
            })
        ));
    }

    #[test]
    fn events_after_close_are_ignored() {
        let mut session = session();
        feed(&mut session, vec![ClientEvent::start(), ClientEvent::end(Some(1))]);

        let late = feed(
            &mut session,
            vec![
                ClientEvent::fail(TestInfo::named("late"), failure("late")),
                ClientEvent::start(),
                ClientEvent::end(Some(5)),
            ],
        );
        assert!(late.is_empty());
        assert_eq!(session.stats().failures, 0);
        assert_eq!(session.stats().duration_ms, 1);
    }

    #[test]
    fn test_event_before_start_starts_implicitly() {
        let mut session = session();
        let signals = session.apply(ClientEvent::pass(TestInfo::named("eager")));
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0], SessionSignal::RunStarted);
        assert_eq!(session.phase(), SessionPhase::Running);
        assert_eq!(session.stats().passes, 1);
    }

    #[test]
    fn repeated_start_does_not_reset_stats() {
        let mut session = session();
        let signals = feed(
            &mut session,
            vec![
                ClientEvent::start(),
                ClientEvent::pass(TestInfo::named("a")),
                ClientEvent::start(),
            ],
        );
        assert_eq!(
            signals
                .iter()
                .filter(|signal| **signal == SessionSignal::RunStarted)
                .count(),
            1
        );
        assert_eq!(session.stats().passes, 1);
    }

    #[test]
    fn end_while_idle_closes_with_empty_stats() {
        let mut session = session();
        let signals = session.apply(ClientEvent::end(None));
        assert_eq!(
            signals,
            vec![SessionSignal::Closed {
                stats: RunStats::default(),
                outcome: RunOutcome::Passed,
            }]
        );
    }

    #[test]
    fn close_without_any_events_still_terminates() {
        let mut session = session();
        assert_eq!(
            session.close(),
            Some(SessionSignal::Closed {
                stats: RunStats::default(),
                outcome: RunOutcome::Aborted,
            })
        );
    }

    #[test]
    fn tracks_suite_depth_and_test_slots() {
        let mut session = session();
        let signals = feed(
            &mut session,
            vec![
                ClientEvent::start(),
                ClientEvent::suite(""),
                ClientEvent::suite("math"),
                ClientEvent::pass(TestInfo::named("adds")),
                ClientEvent::test_end(TestInfo::named("adds")),
                ClientEvent::suite_end("math"),
            ],
        );
        assert!(signals.contains(&SessionSignal::SuiteStarted {
            title: "math".to_string(),
            depth: 2,
        }));
        assert!(signals.contains(&SessionSignal::SuiteEnded {
            title: "math".to_string(),
            depth: 2,
        }));
        assert_eq!(session.suite_depth(), 1);
        assert_eq!(session.tests_ended(), 1);
        assert_eq!(session.stats().passes, 1);

        session.apply(ClientEvent::suite_end(""));
        session.apply(ClientEvent::suite_end(""));
        assert_eq!(session.suite_depth(), 0);
    }

    #[test]
    fn records_sender_timestamp() {
        let mut session = session();
        let mut event = ClientEvent::start();
        event.sent_at = Some("2026-01-30T12:00:00Z".to_string());
        session.apply(event);
        assert_eq!(
            session.last_event_at().map(|at| at.to_rfc3339()),
            Some("2026-01-30T12:00:00+00:00".to_string())
        );
    }
}
