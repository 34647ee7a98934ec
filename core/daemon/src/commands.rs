//! User commands exposed by the hub.
//!
//! Commands are registered by name against a `CommandRouter` so an embedding
//! editor can route them through its own palette. The daemon binary uses the
//! in-process `CommandTable`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ide_mocha_protocol::{allocate, Endpoint, InterfaceMode, ADDRESS_ENV};

use crate::config::HubConfig;
use crate::diagnostics::DiagnosticsSink;
use crate::error::CommandError;
use crate::registry::RemoteInfo;
use crate::status::{FolderStatus, StatusSink};

pub const COPY_ADDRESS: &str = "copy-address";
pub const SHOW_HELP: &str = "show-help";
pub const STATUS: &str = "status";
pub const DIAGNOSTICS: &str = "diagnostics";

/// Read-only view of hub state handed to a command.
pub struct CommandContext<'a> {
    pub config: &'a HubConfig,
    pub remotes: &'a [RemoteInfo],
    pub status: &'a StatusSink,
    pub diagnostics: &'a DiagnosticsSink,
}

pub type CommandHandler = fn(&CommandContext<'_>, &[String]) -> Result<String, CommandError>;

pub trait CommandRouter {
    fn register(&mut self, name: &'static str, handler: CommandHandler);
}

#[derive(Default)]
pub struct CommandTable {
    handlers: BTreeMap<&'static str, CommandHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_commands() -> Self {
        let mut table = Self::new();
        register_builtin_commands(&mut table);
        table
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn dispatch(
        &self,
        context: &CommandContext<'_>,
        name: &str,
        args: &[String],
    ) -> Result<String, CommandError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        handler(context, args)
    }
}

impl CommandRouter for CommandTable {
    fn register(&mut self, name: &'static str, handler: CommandHandler) {
        self.handlers.insert(name, handler);
    }
}

pub fn register_builtin_commands(router: &mut dyn CommandRouter) {
    router.register(COPY_ADDRESS, copy_address);
    router.register(SHOW_HELP, show_help);
    router.register(STATUS, status);
    router.register(DIAGNOSTICS, diagnostics);
}

/// The address reporters should use for `folder`. A live listener's endpoint
/// wins; otherwise the address is derived from the current settings.
fn address_for(context: &CommandContext<'_>, folder: &Path) -> Result<Endpoint, CommandError> {
    if let Some(remote) = context.remotes.iter().find(|remote| remote.folder == folder) {
        return Ok(remote.endpoint.clone());
    }
    let mode: InterfaceMode = context.config.general.interface.parse()?;
    Ok(allocate(folder, mode, &context.config.socket_dir())?)
}

fn folder_arg(args: &[String]) -> Result<PathBuf, CommandError> {
    args.first()
        .map(PathBuf::from)
        .ok_or(CommandError::MissingArgument("folder"))
}

fn copy_address(context: &CommandContext<'_>, args: &[String]) -> Result<String, CommandError> {
    let folder = folder_arg(args)?;
    Ok(address_for(context, &folder)?.to_string())
}

fn show_help(context: &CommandContext<'_>, args: &[String]) -> Result<String, CommandError> {
    let address = match args.first() {
        Some(folder) => address_for(context, Path::new(folder))?.to_string(),
        None => "<address>".to_string(),
    };

    let mut out = String::new();
    out.push_str(&format!(
        "Interface: {}\n",
        context.config.general.interface
    ));
    out.push_str("Send a mocha run to the hub with:\n");
    out.push_str(&format!(
        "  mocha --reporter json-stream | {}={} ide-mocha-reporter send --format json-stream\n",
        ADDRESS_ENV, address
    ));
    out.push_str("Or from a reporter that writes hub events directly:\n");
    out.push_str(&format!(
        "  {}={} ide-mocha-reporter send\n",
        ADDRESS_ENV, address
    ));
    Ok(out)
}

fn status(context: &CommandContext<'_>, _args: &[String]) -> Result<String, CommandError> {
    if context.remotes.is_empty() {
        return Ok("No folders are being served\n".to_string());
    }

    let mut out = String::new();
    for remote in context.remotes {
        let state = match context.status.status(&remote.folder) {
            None => "idle".to_string(),
            Some(FolderStatus::Running) => "running".to_string(),
            Some(FolderStatus::Passed { stats }) => format!("passed ({} passing)", stats.passes),
            Some(FolderStatus::Failed { stats }) => {
                format!("failed ({} failing)", stats.failures)
            }
            Some(FolderStatus::Aborted { .. }) => "aborted".to_string(),
        };
        out.push_str(&format!(
            "{} {} [{}]{}\n",
            remote.folder.display(),
            remote.endpoint,
            state,
            if remote.connected { " connected" } else { "" }
        ));
    }
    Ok(out)
}

fn diagnostics(context: &CommandContext<'_>, args: &[String]) -> Result<String, CommandError> {
    let folder = folder_arg(args)?;
    let entries = context.diagnostics.diagnostics(&folder);
    if entries.is_empty() {
        return Ok(format!("No failures recorded for {}\n", folder.display()));
    }

    let mut out = String::new();
    for entry in entries {
        let location = match (entry.line, entry.column) {
            (Some(line), Some(column)) => format!("{}:{}:{}", entry.file.display(), line, column),
            _ => entry.file.display().to_string(),
        };
        out.push_str(&format!(
            "{}: {} ({})\n",
            location, entry.message, entry.test_title
        ));
    }
    Ok(out)
}
