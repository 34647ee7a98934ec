//! Console rendering of session signals.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::config::{HubConfig, Verbosity};
use crate::router::SignalSink;
use crate::session::{RunOutcome, RunStats, SessionSignal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSettings {
    pub enabled: bool,
    pub verbosity: Verbosity,
    pub durations: bool,
    pub slow_threshold_ms: u64,
    pub show_stack: bool,
}

impl ConsoleSettings {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            enabled: config.console.enabled,
            verbosity: config.general.verbosity,
            durations: config.general.durations,
            slow_threshold_ms: config.general.slow_threshold_ms,
            show_stack: config.console.show_stack,
        }
    }
}

pub struct ConsoleSink {
    settings: RwLock<ConsoleSettings>,
    depths: Mutex<HashMap<PathBuf, usize>>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(settings: ConsoleSettings, writer: Box<dyn Write + Send>) -> Self {
        Self {
            settings: RwLock::new(settings),
            depths: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
        }
    }

    pub fn update_settings(&self, settings: ConsoleSettings) {
        if let Ok(mut current) = self.settings.write() {
            *current = settings;
        }
    }

    /// Lines for one signal under the current settings. Tracks suite depth per
    /// folder so test lines are indented under their suite.
    pub fn render(&self, folder: &Path, signal: &SessionSignal) -> Vec<String> {
        let settings = match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(_) => return Vec::new(),
        };
        if !settings.enabled {
            return Vec::new();
        }

        let depth = self.track_depth(folder, signal);
        let label = folder_label(folder);
        let indent = "  ".repeat(depth);
        let verbose = settings.verbosity >= Verbosity::Verbose;
        let normal = settings.verbosity >= Verbosity::Normal;

        match signal {
            SessionSignal::RunStarted if normal => vec![format!("[{}] run started", label)],
            SessionSignal::SuiteStarted { title, depth } if verbose && !title.is_empty() => {
                vec![format!(
                    "[{}] {}{}",
                    label,
                    "  ".repeat(depth.saturating_sub(1)),
                    title
                )]
            }
            SessionSignal::TestPassed { test } if verbose => {
                let mut line = format!("[{}] {}  ✓ {}", label, indent, test.title);
                if settings.durations {
                    if let Some(duration) = test.duration_ms {
                        if duration >= settings.slow_threshold_ms {
                            line.push_str(&format!(" ({}ms)", duration));
                        }
                    }
                }
                vec![line]
            }
            SessionSignal::TestPending { test } if verbose => {
                vec![format!("[{}] {}  - {}", label, indent, test.title)]
            }
            SessionSignal::TestFailed { test, error } if normal => {
                let mut lines = vec![format!(
                    "[{}] {}  ✗ {}: {}",
                    label,
                    indent,
                    test.display_title(),
                    error.message
                )];
                if settings.show_stack {
                    if let Some(stack) = error.stack.as_deref() {
                        lines.extend(
                            stack
                                .lines()
                                .map(str::trim)
                                .filter(|line| !line.is_empty())
                                .map(|line| format!("[{}] {}      {}", label, indent, line)),
                        );
                    }
                }
                lines
            }
            SessionSignal::Closed { stats, outcome } => summary_lines(&label, stats, *outcome),
            _ => Vec::new(),
        }
    }

    fn track_depth(&self, folder: &Path, signal: &SessionSignal) -> usize {
        let mut depths = match self.depths.lock() {
            Ok(depths) => depths,
            Err(_) => return 0,
        };
        match signal {
            SessionSignal::RunStarted => {
                depths.insert(folder.to_path_buf(), 0);
                0
            }
            SessionSignal::SuiteStarted { depth, .. } => {
                depths.insert(folder.to_path_buf(), *depth);
                *depth
            }
            SessionSignal::SuiteEnded { depth, .. } => {
                let next = depth.saturating_sub(1);
                depths.insert(folder.to_path_buf(), next);
                next
            }
            SessionSignal::Closed { .. } => {
                depths.remove(folder);
                0
            }
            _ => depths.get(folder).copied().unwrap_or(0),
        }
    }
}

impl SignalSink for ConsoleSink {
    fn handle(&self, folder: &Path, signal: &SessionSignal) {
        let lines = self.render(folder, signal);
        if lines.is_empty() {
            return;
        }
        if let Ok(mut writer) = self.writer.lock() {
            for line in lines {
                if let Err(err) = writeln!(writer, "{}", line) {
                    tracing::warn!(error = %err, "Failed to write console output");
                    return;
                }
            }
            let _ = writer.flush();
        }
    }
}

pub fn folder_label(folder: &Path) -> String {
    folder
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| folder.display().to_string())
}

fn summary_lines(label: &str, stats: &RunStats, outcome: RunOutcome) -> Vec<String> {
    if outcome == RunOutcome::Aborted {
        return vec![format!(
            "[{}] run aborted: {} passing, {} failing, {} pending",
            label, stats.passes, stats.failures, stats.pending
        )];
    }

    let mut lines = vec![format!(
        "[{}] {} passing ({}ms)",
        label, stats.passes, stats.duration_ms
    )];
    if stats.failures > 0 {
        lines.push(format!("[{}] {} failing", label, stats.failures));
    }
    if stats.pending > 0 {
        lines.push(format!("[{}] {} pending", label, stats.pending));
    }
    lines
}
