//! Busy state per folder and end-of-run notifications.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::console::folder_label;
use crate::router::SignalSink;
use crate::session::{RunOutcome, RunStats, SessionSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum FolderStatus {
    Running,
    Passed { stats: RunStats },
    Failed { stats: RunStats },
    Aborted { stats: RunStats },
}

impl FolderStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, FolderStatus::Running)
    }

    fn finished(stats: RunStats, outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Passed => FolderStatus::Passed { stats },
            RunOutcome::Failed => FolderStatus::Failed { stats },
            RunOutcome::Aborted => FolderStatus::Aborted { stats },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

/// The notification a finished run should raise, if the config asks for one.
pub fn notification_for(
    config: &NotificationConfig,
    label: &str,
    stats: &RunStats,
    outcome: RunOutcome,
) -> Option<Notification> {
    match outcome {
        RunOutcome::Passed if config.on_success => Some(Notification {
            level: NotificationLevel::Info,
            message: format!(
                "{}: {} passing, {} pending ({}ms)",
                label, stats.passes, stats.pending, stats.duration_ms
            ),
        }),
        RunOutcome::Failed if config.on_failure => Some(Notification {
            level: NotificationLevel::Error,
            message: format!(
                "{}: {} failing, {} passing",
                label, stats.failures, stats.passes
            ),
        }),
        RunOutcome::Aborted if config.on_abort => Some(Notification {
            level: NotificationLevel::Warning,
            message: format!(
                "{}: run aborted after {} tests",
                label,
                stats.passes + stats.failures + stats.pending
            ),
        }),
        _ => None,
    }
}

pub struct StatusSink {
    statuses: Mutex<HashMap<PathBuf, FolderStatus>>,
    notifications: RwLock<NotificationConfig>,
    last_notification: Mutex<Option<Notification>>,
}

impl StatusSink {
    pub fn new(notifications: NotificationConfig) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            notifications: RwLock::new(notifications),
            last_notification: Mutex::new(None),
        }
    }

    pub fn update_notifications(&self, notifications: NotificationConfig) {
        if let Ok(mut current) = self.notifications.write() {
            *current = notifications;
        }
    }

    pub fn status(&self, folder: &Path) -> Option<FolderStatus> {
        self.statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(folder).copied())
    }

    pub fn statuses(&self) -> Vec<(PathBuf, FolderStatus)> {
        let mut statuses: Vec<_> = self
            .statuses
            .lock()
            .map(|statuses| {
                statuses
                    .iter()
                    .map(|(folder, status)| (folder.clone(), *status))
                    .collect()
            })
            .unwrap_or_default();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn busy_folders(&self) -> Vec<PathBuf> {
        self.statuses()
            .into_iter()
            .filter(|(_, status)| status.is_busy())
            .map(|(folder, _)| folder)
            .collect()
    }

    pub fn is_busy(&self) -> bool {
        !self.busy_folders().is_empty()
    }

    pub fn last_notification(&self) -> Option<Notification> {
        self.last_notification
            .lock()
            .ok()
            .and_then(|last| last.clone())
    }

    pub fn retain_folders(&self, keep: impl Fn(&Path) -> bool) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.retain(|folder, _| keep(folder.as_path()));
        }
    }

    fn set(&self, folder: &Path, status: FolderStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(folder.to_path_buf(), status);
        }
    }

    fn notify(&self, folder: &Path, stats: &RunStats, outcome: RunOutcome) {
        let config = match self.notifications.read() {
            Ok(config) => config.clone(),
            Err(_) => return,
        };
        let Some(notification) = notification_for(&config, &folder_label(folder), stats, outcome)
        else {
            return;
        };

        match notification.level {
            NotificationLevel::Info => info!(
                target: "ide_mocha::notify",
                folder = %folder.display(),
                outcome = outcome.as_str(),
                "{}",
                notification.message
            ),
            NotificationLevel::Warning | NotificationLevel::Error => warn!(
                target: "ide_mocha::notify",
                folder = %folder.display(),
                outcome = outcome.as_str(),
                "{}",
                notification.message
            ),
        }

        if let Ok(mut last) = self.last_notification.lock() {
            *last = Some(notification);
        }
    }
}

impl SignalSink for StatusSink {
    fn handle(&self, folder: &Path, signal: &SessionSignal) {
        match signal {
            SessionSignal::RunStarted => self.set(folder, FolderStatus::Running),
            SessionSignal::Closed { stats, outcome } => {
                self.set(folder, FolderStatus::finished(*stats, *outcome));
                self.notify(folder, stats, *outcome);
            }
            _ => {}
        }
    }
}
