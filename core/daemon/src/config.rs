//! Hub configuration, read from `~/.ide-mocha/config.toml`.
//!
//! Every field has a default and a missing file is not an error. The interface
//! mode is kept as the raw string from the file and only parsed when endpoints
//! are allocated, so a bad value fails listener creation rather than startup.

use ide_mocha_protocol::address::default_socket_dir;
use ide_mocha_protocol::MAX_EVENT_BYTES;
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::registry::ListenerSettings;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".ide-mocha/config.toml";
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 75;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneralConfig {
    pub interface: String,
    pub verbosity: Verbosity,
    pub durations: bool,
    pub slow_threshold_ms: u64,
    pub socket_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            interface: "local-socket".to_string(),
            verbosity: Verbosity::Normal,
            durations: true,
            slow_threshold_ms: DEFAULT_SLOW_THRESHOLD_MS,
            socket_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub show_stack: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_stack: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    pub on_success: bool,
    pub on_failure: bool,
    pub on_abort: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            on_success: true,
            on_failure: true,
            on_abort: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HubConfig {
    pub general: GeneralConfig,
    pub console: ConsoleConfig,
    pub notifications: NotificationConfig,
}

impl HubConfig {
    pub fn socket_dir(&self) -> PathBuf {
        self.general
            .socket_dir
            .clone()
            .unwrap_or_else(default_socket_dir)
    }

    /// The subset of settings that determines where listeners bind. A change
    /// here forces a full registry rebuild.
    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            interface: self.general.interface.clone(),
            socket_dir: self.socket_dir(),
            max_event_bytes: MAX_EVENT_BYTES,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: Option<PathBuf>) -> Result<HubConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(HubConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    toml::from_str::<HubConfig>(&content).map_err(|source| ConfigError::Parse {
        path: config_path,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config =
            load_config(Some(temp_dir.path().join("missing.toml"))).expect("load config");
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.general.interface, "local-socket");
        assert_eq!(config.socket_dir(), default_socket_dir());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[general]
interface = "ip"
verbosity = "verbose"
durations = false
slow_threshold_ms = 200
socket_dir = "/run/user/1000"

[console]
show_stack = true

[notifications]
on_success = false
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load config");
        assert_eq!(config.general.interface, "ip");
        assert_eq!(config.general.verbosity, Verbosity::Verbose);
        assert!(!config.general.durations);
        assert_eq!(config.general.slow_threshold_ms, 200);
        assert_eq!(config.socket_dir(), PathBuf::from("/run/user/1000"));
        assert!(config.console.enabled);
        assert!(config.console.show_stack);
        assert!(!config.notifications.on_success);
        assert!(config.notifications.on_failure);
    }

    #[test]
    fn unknown_interface_is_kept_for_allocation_to_reject() {
        let config: HubConfig =
            toml::from_str("[general]\ninterface = \"pipe\"\n").expect("parse config");
        assert_eq!(config.listener_settings().interface, "pipe");
    }

    #[test]
    fn load_config_reports_parse_errors() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[general]\nverbosity = \"loud\"\n").expect("write config");
        assert!(matches!(
            load_config(Some(path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
