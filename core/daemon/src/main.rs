//! ide-mocha daemon entrypoint.
//!
//! Hosts a `Hub` for a set of workspace folders and takes control lines on
//! stdin, one per line:
//!
//! - `add <folder>` / `remove <folder>`: change the folder set
//! - `folders [<folder>...]`: replace the folder set, or print the live remotes
//!   as JSON when no folders are given. A JSON array of paths is accepted too.
//! - `reload`: re-read the config file and apply it
//! - `retry`: recreate listeners that failed to bind
//! - `quit`: drain and exit
//! - anything else is run as a hub command (`status`, `copy-address <folder>`, ...)
//!
//! EOF on stdin or Ctrl-C drains every remote before exiting.

use std::env;
use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ide_mocha_daemon::{load_config, Hub, HubConfig};

#[derive(Parser)]
#[command(name = "ide-mocha-daemon")]
#[command(about = "Per-folder hub for mocha test runs")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.ide-mocha/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Workspace folder to serve; repeat for several folders
    #[arg(long = "folder", value_name = "PATH")]
    folders: Vec<PathBuf>,
}

enum Control {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match load_config(cli.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            HubConfig::default()
        }
    };

    let mut hub = Hub::init(config, Box::new(std::io::stdout()), Vec::new());
    let folders = cli
        .folders
        .iter()
        .filter_map(|folder| absolute_folder(folder))
        .collect();
    hub.set_folders(folders).await;
    info!(remotes = hub.registry().len(), "ide-mocha daemon started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; draining remotes");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Control::Quit = handle_control_line(&mut hub, cli.config.clone(), &line).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        error!(error = %err, "Failed to read control input");
                        break;
                    }
                }
            }
        }
    }

    hub.dispose().await;
}

async fn handle_control_line(hub: &mut Hub, config_path: Option<PathBuf>, line: &str) -> Control {
    let line = line.trim();
    if line.is_empty() {
        return Control::Continue;
    }
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    match name {
        "quit" | "exit" => return Control::Quit,
        "add" => match absolute_folder(Path::new(rest)).filter(|_| !rest.is_empty()) {
            Some(folder) => {
                hub.add_folder(folder).await;
            }
            None => warn!("add requires a folder"),
        },
        "remove" => match absolute_folder(Path::new(rest)).filter(|_| !rest.is_empty()) {
            Some(folder) => {
                hub.remove_folder(&folder).await;
            }
            None => warn!("remove requires a folder"),
        },
        "folders" if rest.is_empty() => {
            match serde_json::to_string_pretty(&hub.registry().remotes()) {
                Ok(json) => println!("{}", json),
                Err(err) => warn!(error = %err, "Failed to serialize remotes"),
            }
        }
        "folders" => match folder_list(rest) {
            Ok(folders) => {
                let folders = folders
                    .iter()
                    .filter_map(|folder| absolute_folder(folder))
                    .collect();
                hub.set_folders(folders).await;
            }
            Err(err) => warn!(error = %err, "folders expects paths or a JSON array of paths"),
        },
        "reload" => match load_config(config_path) {
            Ok(config) => {
                if hub.apply_config(config).await.is_none() {
                    info!("Config reloaded; listeners unchanged");
                }
            }
            Err(err) => warn!(error = %err, "Failed to reload config; keeping current settings"),
        },
        "retry" => {
            hub.retry_failed().await;
        }
        command => {
            match hub.run_command(command, &command_args(rest)) {
                Ok(output) => print!("{}", output),
                Err(err) => warn!(command, error = %err, "Command failed"),
            }
        }
    }
    Control::Continue
}

/// `folders` takes whitespace-separated paths, or a JSON array for paths that
/// contain spaces.
fn folder_list(rest: &str) -> Result<Vec<PathBuf>, serde_json::Error> {
    if rest.starts_with('[') {
        return serde_json::from_str(rest);
    }
    Ok(rest.split_whitespace().map(PathBuf::from).collect())
}

/// Hub commands take at most one folder, which may contain spaces. It is
/// resolved against the working directory like `add` and `remove`.
fn command_args(rest: &str) -> Vec<String> {
    if rest.is_empty() {
        return Vec::new();
    }
    match absolute_folder(Path::new(rest)) {
        Some(folder) => vec![folder.to_string_lossy().into_owned()],
        None => vec![rest.to_string()],
    }
}

fn absolute_folder(folder: &Path) -> Option<PathBuf> {
    if folder.is_absolute() {
        return Some(folder.to_path_buf());
    }
    match env::current_dir() {
        Ok(cwd) => Some(cwd.join(folder)),
        Err(err) => {
            warn!(error = %err, folder = %folder.display(), "Failed to resolve folder");
            None
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("IDE_MOCHA_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_list_accepts_json_for_paths_with_spaces() {
        let folders = folder_list(r#"["/work/my app", "/work/lib"]"#).expect("json list");
        assert_eq!(
            folders,
            vec![PathBuf::from("/work/my app"), PathBuf::from("/work/lib")]
        );

        let folders = folder_list("/work/app /work/lib").expect("plain list");
        assert_eq!(folders.len(), 2);
        assert!(folder_list("[\"/work/app\"").is_err());
    }

    #[test]
    fn command_args_resolve_relative_folders() {
        assert!(command_args("").is_empty());
        assert_eq!(command_args("/work/my app"), vec!["/work/my app".to_string()]);

        let cwd = env::current_dir().expect("cwd");
        assert_eq!(
            command_args("app"),
            vec![cwd.join("app").to_string_lossy().into_owned()]
        );
    }
}
