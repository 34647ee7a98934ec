//! Deterministic endpoint allocation for project folders.
//!
//! The hub and the reporter both derive a folder's endpoint from its base name
//! alone, so a test process can find its hub without any handshake. Two folders
//! that share a base name under different parents therefore share an endpoint;
//! that is a known limitation of the scheme, not something resolved here.
//!
//! Port derivation (`ip` mode) is fixed: take the MD5 digest of the UTF-8 base
//! name, read its first four bytes as a big-endian `u32`, reduce it modulo the
//! width of `PORT_RANGE_START..=PORT_RANGE_END` and add `PORT_RANGE_START`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const PORT_RANGE_START: u16 = 49152;
pub const PORT_RANGE_END: u16 = 65535;
pub const SOCKET_PREFIX: &str = "ide-mocha-";
pub const SOCKET_EXTENSION: &str = "sock";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceMode {
    #[serde(rename = "local-socket")]
    LocalSocket,
    #[serde(rename = "ip")]
    Ip,
}

impl InterfaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceMode::LocalSocket => "local-socket",
            InterfaceMode::Ip => "ip",
        }
    }
}

impl Default for InterfaceMode {
    fn default() -> Self {
        Self::LocalSocket
    }
}

impl FromStr for InterfaceMode {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "local-socket" => Ok(InterfaceMode::LocalSocket),
            "ip" => Ok(InterfaceMode::Ip),
            other => Err(AddressError::InvalidConfiguration(format!(
                "unrecognized interface mode {:?} (expected \"local-socket\" or \"ip\")",
                other
            ))),
        }
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    LocalSocket(PathBuf),
    /// Loopback TCP port.
    Tcp(u16),
}

impl Endpoint {
    pub fn mode(&self) -> InterfaceMode {
        match self {
            Endpoint::LocalSocket(_) => InterfaceMode::LocalSocket,
            Endpoint::Tcp(_) => InterfaceMode::Ip,
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Endpoint::LocalSocket(path) => Some(path),
            Endpoint::Tcp(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::LocalSocket(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(port) => write!(f, "{}", port),
        }
    }
}

/// Parses an address string as produced by `Display`: all digits is a TCP
/// port, anything else is a socket path.
impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() {
            return Err(AddressError::InvalidConfiguration(
                "address is empty".to_string(),
            ));
        }
        if value.bytes().all(|b| b.is_ascii_digit()) {
            return match value.parse::<u16>() {
                Ok(port) if port > 0 => Ok(Endpoint::Tcp(port)),
                _ => Err(AddressError::InvalidConfiguration(format!(
                    "port {} is out of range",
                    value
                ))),
            };
        }
        Ok(Endpoint::LocalSocket(PathBuf::from(value)))
    }
}

pub fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

pub fn allocate(
    folder: &Path,
    mode: InterfaceMode,
    socket_dir: &Path,
) -> Result<Endpoint, AddressError> {
    if !folder.is_absolute() {
        return Err(AddressError::InvalidConfiguration(format!(
            "project folder must be absolute: {}",
            folder.display()
        )));
    }
    let base_name = folder
        .file_name()
        .map(|name| name.to_string_lossy())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            AddressError::InvalidConfiguration(format!(
                "project folder has no base name: {}",
                folder.display()
            ))
        })?;

    Ok(match mode {
        InterfaceMode::LocalSocket => Endpoint::LocalSocket(socket_dir.join(format!(
            "{}{}.{}",
            SOCKET_PREFIX, base_name, SOCKET_EXTENSION
        ))),
        InterfaceMode::Ip => Endpoint::Tcp(port_for_name(&base_name)),
    })
}

fn port_for_name(name: &str) -> u16 {
    let digest = md5::compute(name.as_bytes()).0;
    let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let width = u32::from(PORT_RANGE_END - PORT_RANGE_START) + 1;
    // Always below width, so the sum stays inside the range.
    PORT_RANGE_START + (value % width) as u16
}
