//! Per-folder diagnostics built from failed tests.
//!
//! A failure is located at the first stack frame that points into the folder's
//! own sources (dependencies under `node_modules` are skipped). When no frame
//! qualifies, the test's file is used without a position. Entries for a folder
//! are cleared when its next run starts.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use ide_mocha_protocol::{ErrorDetail, TestInfo};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::router::SignalSink;
use crate::session::SessionSignal;

static STACK_FRAME: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s(])((?:[A-Za-z]:)?[^\s():]+):(\d+):(\d+)\)?\s*$").ok()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub message: String,
    pub test_title: String,
}

#[derive(Default)]
pub struct DiagnosticsSink {
    entries: Mutex<HashMap<PathBuf, Vec<Diagnostic>>>,
}

impl DiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self, folder: &Path) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(folder).cloned())
            .unwrap_or_default()
    }

    pub fn clear(&self, folder: &Path) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(folder);
        }
    }

    pub fn retain_folders(&self, keep: impl Fn(&Path) -> bool) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|folder, _| keep(folder.as_path()));
        }
    }
}

impl SignalSink for DiagnosticsSink {
    fn handle(&self, folder: &Path, signal: &SessionSignal) {
        match signal {
            SessionSignal::RunStarted => self.clear(folder),
            SessionSignal::TestFailed { test, error } => {
                if let Some(diagnostic) = diagnostic_for(folder, test, error) {
                    if let Ok(mut entries) = self.entries.lock() {
                        entries
                            .entry(folder.to_path_buf())
                            .or_default()
                            .push(diagnostic);
                    }
                }
            }
            _ => {}
        }
    }
}

pub fn diagnostic_for(folder: &Path, test: &TestInfo, error: &ErrorDetail) -> Option<Diagnostic> {
    let located = error
        .stack
        .as_deref()
        .and_then(|stack| locate_in_stack(folder, stack));

    let (file, line, column) = match located {
        Some((file, line, column)) => (file, Some(line), Some(column)),
        None => {
            let file = test.file.as_deref().map(|file| resolve(folder, file))?;
            (file, None, None)
        }
    };

    Some(Diagnostic {
        file,
        line,
        column,
        message: error.message.clone(),
        test_title: test.display_title().to_string(),
    })
}

/// First `path:line:col` frame that lives inside `folder` and outside
/// `node_modules`.
pub fn locate_in_stack(folder: &Path, stack: &str) -> Option<(PathBuf, u32, u32)> {
    let pattern = STACK_FRAME.as_ref()?;

    stack.lines().find_map(|line| {
        let captures = pattern.captures(line.trim())?;
        let path = resolve(folder, captures.get(1)?.as_str());
        if !path.starts_with(folder) || in_node_modules(&path) {
            return None;
        }
        let line = captures.get(2)?.as_str().parse().ok()?;
        let column = captures.get(3)?.as_str().parse().ok()?;
        Some((path, line, column))
    })
}

fn resolve(folder: &Path, file: &str) -> PathBuf {
    let file = file.strip_prefix("file://").unwrap_or(file);
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        folder.join(path)
    }
}

fn in_node_modules(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::Normal(name) if name == "node_modules"))
}
