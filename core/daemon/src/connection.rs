//! Reader loop for one accepted reporter connection.
//!
//! Each line is decoded by the protocol crate, applied to the connection's
//! `Session`, and the resulting signals are dispatched in order. The loop ends
//! on EOF, on a read error, on an oversized line, or when the owning listener
//! asks it to stop. In every case the session is closed on the way out, so the
//! terminal signal is produced exactly once.

use ide_mocha_protocol::parse_event_line;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::router::NotificationRouter;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Eof,
    ReadError,
    Oversized,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Eof => "eof",
            CloseReason::ReadError => "read_error",
            CloseReason::Oversized => "oversized_event",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

enum LineRead {
    Line,
    Eof,
    Oversized,
}

pub(crate) async fn serve_connection<S>(
    stream: S,
    folder: PathBuf,
    router: Arc<NotificationRouter>,
    mut shutdown: watch::Receiver<bool>,
    max_event_bytes: usize,
) -> CloseReason
where
    S: AsyncRead + Unpin,
{
    let mut session = Session::new(folder);
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut skipped = 0u64;

    info!(folder = %session.folder().display(), "Reporter connected");

    let reason = loop {
        if *shutdown.borrow() {
            break CloseReason::Shutdown;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                // A dropped sender means the listener is gone as well.
                if changed.is_err() || *shutdown.borrow() {
                    break CloseReason::Shutdown;
                }
            }
            read = read_event_line(&mut reader, &mut line, max_event_bytes) => {
                match read {
                    Ok(LineRead::Line) => {
                        if line.iter().all(|b| b.is_ascii_whitespace()) {
                            continue;
                        }
                        match parse_event_line(&line) {
                            Ok(event) => {
                                for signal in session.apply(event) {
                                    router.dispatch(session.folder(), &signal);
                                }
                            }
                            Err(err) => {
                                skipped += 1;
                                warn!(
                                    folder = %session.folder().display(),
                                    code = %err.code,
                                    message = %err.message,
                                    "Skipping malformed event"
                                );
                            }
                        }
                    }
                    Ok(LineRead::Eof) => break CloseReason::Eof,
                    Ok(LineRead::Oversized) => {
                        warn!(
                            folder = %session.folder().display(),
                            limit = max_event_bytes,
                            "Event exceeded maximum size; closing connection"
                        );
                        break CloseReason::Oversized;
                    }
                    Err(err) => {
                        warn!(
                            folder = %session.folder().display(),
                            error = %err,
                            "Failed to read from reporter"
                        );
                        break CloseReason::ReadError;
                    }
                }
            }
        }
    };

    if let Some(signal) = session.close() {
        router.dispatch(session.folder(), &signal);
    }

    debug!(
        folder = %session.folder().display(),
        reason = reason.as_str(),
        skipped,
        "Reporter connection closed"
    );
    reason
}

async fn read_event_line<R>(
    reader: &mut BufReader<R>,
    line: &mut Vec<u8>,
    max_event_bytes: usize,
) -> std::io::Result<LineRead>
where
    R: AsyncRead + Unpin,
{
    line.clear();
    let limit = max_event_bytes as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', line).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if line.last() != Some(&b'\n') && line.len() > max_event_bytes {
        return Ok(LineRead::Oversized);
    }
    Ok(LineRead::Line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RecordingSink;
    use crate::session::{RunOutcome, SessionSignal};
    use ide_mocha_protocol::{encode_event_line, ClientEvent, TestInfo};
    use tokio::io::AsyncWriteExt;

    fn harness() -> (Arc<RecordingSink>, Arc<NotificationRouter>, PathBuf) {
        let sink = Arc::new(RecordingSink::new());
        let router = Arc::new(NotificationRouter::new().with_sink(sink.clone()));
        (sink, router, PathBuf::from("/work/app"))
    }

    fn lines(events: &[ClientEvent]) -> Vec<u8> {
        events
            .iter()
            .flat_map(|event| encode_event_line(event).expect("encode"))
            .collect()
    }

    #[tokio::test]
    async fn skips_malformed_lines_and_keeps_reading() {
        let (sink, router, folder) = harness();
        let (_tx, rx) = watch::channel(false);

        let mut input = lines(&[ClientEvent::start()]);
        input.extend_from_slice(b"{not json}\n\n");
        input.extend(lines(&[
            ClientEvent::pass(TestInfo::named("a")),
            ClientEvent::end(Some(3)),
        ]));

        let reason =
            serve_connection(input.as_slice(), folder.clone(), router, rx, 1024).await;
        assert_eq!(reason, CloseReason::Eof);

        let terminals = sink.terminal_signals(&folder);
        assert_eq!(terminals.len(), 1);
        match &terminals[0] {
            SessionSignal::Closed { stats, outcome } => {
                assert_eq!(*outcome, RunOutcome::Passed);
                assert_eq!(stats.passes, 1);
                assert_eq!(stats.duration_ms, 3);
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_line_force_closes_as_aborted() {
        let (sink, router, folder) = harness();
        let (_tx, rx) = watch::channel(false);

        let mut input = lines(&[ClientEvent::start()]);
        input.extend(std::iter::repeat(b'x').take(200));
        input.push(b'\n');
        input.extend(lines(&[ClientEvent::end(None)]));

        let reason = serve_connection(input.as_slice(), folder.clone(), router, rx, 64).await;
        assert_eq!(reason, CloseReason::Oversized);
        assert!(matches!(
            sink.terminal_signals(&folder).as_slice(),
            [SessionSignal::Closed {
                outcome: RunOutcome::Aborted,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn final_line_without_newline_is_applied() {
        let (sink, router, folder) = harness();
        let (_tx, rx) = watch::channel(false);

        let mut input = lines(&[ClientEvent::start()]);
        input.extend_from_slice(br#"{"event":"end"}"#);

        serve_connection(input.as_slice(), folder.clone(), router, rx, 1024).await;
        assert!(matches!(
            sink.terminal_signals(&folder).as_slice(),
            [SessionSignal::Closed {
                outcome: RunOutcome::Passed,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn shutdown_tears_down_idle_connection_once() {
        let (sink, router, folder) = harness();
        let (tx, rx) = watch::channel(false);
        let (mut client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(serve_connection(server, folder.clone(), router, rx, 1024));
        client
            .write_all(&lines(&[ClientEvent::start()]))
            .await
            .expect("write start");
        client.flush().await.expect("flush");

        // Give the reader a chance to consume the start event before teardown.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).expect("signal shutdown");

        let reason = task.await.expect("join connection task");
        assert_eq!(reason, CloseReason::Shutdown);
        let terminals = sink.terminal_signals(&folder);
        assert_eq!(terminals.len(), 1);
        assert!(sink
            .signals()
            .iter()
            .any(|(_, signal)| *signal == SessionSignal::RunStarted));
        drop(client);
    }
}
