//! Fan-out of session signals to output sinks.
//!
//! Sinks are the display side of the hub: console, diagnostics, busy state and
//! notifications, or anything an embedding editor registers. The contractual
//! lifecycle surface is `RunStarted` (run start) and `Closed` (session close
//! with final stats); everything else is progress detail.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::session::SessionSignal;

pub trait SignalSink: Send + Sync {
    fn handle(&self, folder: &Path, signal: &SessionSignal);
}

#[derive(Default, Clone)]
pub struct NotificationRouter {
    sinks: Vec<Arc<dyn SignalSink>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn dispatch(&self, folder: &Path, signal: &SessionSignal) {
        for sink in &self.sinks {
            sink.handle(folder, signal);
        }
    }
}

/// Records every signal it sees. Used by tests and by embedders that poll.
#[derive(Default)]
pub struct RecordingSink {
    signals: Mutex<Vec<(PathBuf, SessionSignal)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<(PathBuf, SessionSignal)> {
        self.signals
            .lock()
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }

    pub fn terminal_signals(&self, folder: &Path) -> Vec<SessionSignal> {
        self.signals()
            .into_iter()
            .filter(|(recorded, signal)| recorded == folder && signal.is_terminal())
            .map(|(_, signal)| signal)
            .collect()
    }
}

impl SignalSink for RecordingSink {
    fn handle(&self, folder: &Path, signal: &SessionSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push((folder.to_path_buf(), signal.clone()));
        }
    }
}
