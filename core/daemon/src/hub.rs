//! The hub context: configuration, the folder set, the remote registry and the
//! built-in sinks, owned together by whoever hosts the hub.
//!
//! Mutations (folder changes, config reloads, teardown) are serialized through
//! `&mut self`, so a rebuild never interleaves with another reconcile.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::commands::{CommandContext, CommandTable};
use crate::config::HubConfig;
use crate::console::{ConsoleSettings, ConsoleSink};
use crate::diagnostics::DiagnosticsSink;
use crate::error::CommandError;
use crate::registry::{ReconcileReport, RemoteRegistry};
use crate::router::{NotificationRouter, SignalSink};
use crate::status::StatusSink;

pub struct Hub {
    config: HubConfig,
    folders: BTreeSet<PathBuf>,
    registry: RemoteRegistry,
    console: Arc<ConsoleSink>,
    status: Arc<StatusSink>,
    diagnostics: Arc<DiagnosticsSink>,
    commands: CommandTable,
}

impl Hub {
    /// Builds the hub with the built-in sinks followed by `extra_sinks`. No
    /// listeners exist until folders are set.
    pub fn init(
        config: HubConfig,
        console_writer: Box<dyn Write + Send>,
        extra_sinks: Vec<Arc<dyn SignalSink>>,
    ) -> Self {
        let console = Arc::new(ConsoleSink::new(
            ConsoleSettings::from_config(&config),
            console_writer,
        ));
        let status = Arc::new(StatusSink::new(config.notifications.clone()));
        let diagnostics = Arc::new(DiagnosticsSink::new());

        let mut router = NotificationRouter::new()
            .with_sink(console.clone())
            .with_sink(status.clone())
            .with_sink(diagnostics.clone());
        for sink in extra_sinks {
            router = router.with_sink(sink);
        }

        let registry = RemoteRegistry::new(config.listener_settings(), Arc::new(router));
        info!(
            interface = %config.general.interface,
            socket_dir = %config.socket_dir().display(),
            "Hub initialized"
        );

        Self {
            config,
            folders: BTreeSet::new(),
            registry,
            console,
            status,
            diagnostics,
            commands: CommandTable::with_builtin_commands(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn folders(&self) -> &BTreeSet<PathBuf> {
        &self.folders
    }

    pub fn registry(&self) -> &RemoteRegistry {
        &self.registry
    }

    pub fn status(&self) -> &StatusSink {
        &self.status
    }

    pub fn diagnostics(&self) -> &DiagnosticsSink {
        &self.diagnostics
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Replaces the folder set and reconciles listeners against it.
    pub async fn set_folders(&mut self, folders: BTreeSet<PathBuf>) -> ReconcileReport {
        self.folders = folders;
        let report = self.registry.reconcile(&self.folders).await;
        // After teardown, so the closing signals of removed folders are dropped too.
        self.forget_removed_folders();
        log_failures(&report);
        report
    }

    pub async fn add_folder(&mut self, folder: PathBuf) -> ReconcileReport {
        let mut folders = self.folders.clone();
        folders.insert(folder);
        self.set_folders(folders).await
    }

    pub async fn remove_folder(&mut self, folder: &Path) -> ReconcileReport {
        let mut folders = self.folders.clone();
        folders.remove(folder);
        self.set_folders(folders).await
    }

    /// Retries folders whose listener is missing, e.g. after a bind failure.
    pub async fn retry_failed(&mut self) -> ReconcileReport {
        let report = self.registry.reconcile(&self.folders).await;
        log_failures(&report);
        report
    }

    /// Applies a new config. Sink settings update in place. When the listener
    /// settings change every remote is destroyed before any is recreated, so
    /// old and new endpoints never coexist; `None` means no rebuild happened.
    pub async fn apply_config(&mut self, config: HubConfig) -> Option<ReconcileReport> {
        self.console
            .update_settings(ConsoleSettings::from_config(&config));
        self.status
            .update_notifications(config.notifications.clone());

        let settings = config.listener_settings();
        self.config = config;
        if *self.registry.settings() == settings {
            return None;
        }

        info!(
            interface = %settings.interface,
            socket_dir = %settings.socket_dir.display(),
            "Listener settings changed; rebuilding remotes"
        );
        let teardown = self.registry.reconcile(&BTreeSet::new()).await;
        self.registry.set_settings(settings);
        let mut rebuild = self.registry.reconcile(&self.folders).await;
        rebuild.destroyed = teardown.destroyed;
        log_failures(&rebuild);
        Some(rebuild)
    }

    pub fn run_command(&self, name: &str, args: &[String]) -> Result<String, CommandError> {
        let remotes = self.registry.remotes();
        let context = CommandContext {
            config: &self.config,
            remotes: &remotes,
            status: &self.status,
            diagnostics: &self.diagnostics,
        };
        self.commands.dispatch(&context, name, args)
    }

    /// Tears down every remote, closing active sessions with a terminal
    /// signal. The folder set is kept so a later `retry_failed` can restore it.
    pub async fn drain(&mut self) -> ReconcileReport {
        self.registry.shutdown().await
    }

    pub async fn dispose(mut self) {
        let report = self.drain().await;
        info!(destroyed = report.destroyed.len(), "Hub disposed");
    }

    fn forget_removed_folders(&self) {
        let folders = &self.folders;
        self.status.retain_folders(|folder| folders.contains(folder));
        self.diagnostics
            .retain_folders(|folder| folders.contains(folder));
    }
}

fn log_failures(report: &ReconcileReport) {
    for (folder, err) in &report.failed {
        warn!(folder = %folder.display(), error = %err, "Remote unavailable");
    }
}
