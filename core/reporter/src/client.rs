//! Connection to a folder's hub listener.
//!
//! The reporter writes one event per line and never reads a reply. A dropped
//! connection ends the run on the hub side, so failures are surfaced to the
//! caller instead of retried mid-stream.

use std::env;
use std::io::{BufRead, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use ide_mocha_protocol::{
    allocate, encode_event_line, Endpoint, EventKind, InterfaceMode, ADDRESS_ENV,
};
use tracing::{debug, warn};

use crate::error::ReporterError;
use crate::translate::{translate_line, InputFormat};

const WRITE_TIMEOUT_MS: u64 = 2000;
const RETRY_DELAY_MS: u64 = 50;

/// Where to send events. An explicit address wins, then `IDE_MOCHA_ADDRESS`,
/// then the address derived from the folder.
pub struct Target {
    pub address: Option<String>,
    pub folder: Option<PathBuf>,
    pub interface: InterfaceMode,
    pub socket_dir: PathBuf,
}

pub fn resolve_endpoint(target: &Target) -> Result<Endpoint, ReporterError> {
    let from_env = env::var(ADDRESS_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty());
    if let Some(address) = target.address.clone().or(from_env) {
        return Ok(address.trim().parse()?);
    }

    let folder = match target.folder.clone() {
        Some(folder) => absolute(folder)?,
        None => env::current_dir().map_err(ReporterError::CurrentDir)?,
    };
    Ok(allocate(&folder, target.interface, &target.socket_dir)?)
}

fn absolute(folder: PathBuf) -> Result<PathBuf, ReporterError> {
    if folder.is_absolute() {
        return Ok(folder);
    }
    let cwd = env::current_dir().map_err(ReporterError::CurrentDir)?;
    Ok(cwd.join(folder))
}

pub enum HubConnection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl HubConnection {
    /// Connects once, retrying a single time after a short delay.
    pub fn connect(endpoint: &Endpoint) -> Result<Self, ReporterError> {
        match Self::connect_once(endpoint) {
            Ok(connection) => Ok(connection),
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "Connect failed; retrying");
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                Self::connect_once(endpoint).map_err(|source| ReporterError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                })
            }
        }
    }

    fn connect_once(endpoint: &Endpoint) -> std::io::Result<Self> {
        let timeout = Some(Duration::from_millis(WRITE_TIMEOUT_MS));
        match endpoint {
            Endpoint::LocalSocket(path) => {
                let stream = UnixStream::connect(path)?;
                stream.set_write_timeout(timeout)?;
                Ok(Self::Unix(stream))
            }
            Endpoint::Tcp(port) => {
                let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, *port))?;
                stream.set_write_timeout(timeout)?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
        }
    }
}

impl Write for HubConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Unix(stream) => stream.write(buf),
            Self::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Unix(stream) => stream.flush(),
            Self::Tcp(stream) => stream.flush(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    pub forwarded: u64,
    pub skipped: u64,
    pub saw_end: bool,
}

/// Reads lines from `input`, validates them and writes them to `output` until
/// EOF. Invalid lines are skipped with a warning so one bad line does not cost
/// the hub the rest of the run.
pub fn forward<R, W>(
    input: R,
    output: &mut W,
    format: InputFormat,
) -> Result<ForwardSummary, ReporterError>
where
    R: BufRead,
    W: Write,
{
    let mut summary = ForwardSummary::default();

    for line in input.lines() {
        let line = line.map_err(ReporterError::Read)?;
        let mut event = match translate_line(format, &line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(err) => {
                summary.skipped += 1;
                warn!(code = %err.code, message = %err.message, "Skipping invalid test event");
                continue;
            }
        };

        if event.sent_at.is_none() {
            event.sent_at = Some(Utc::now().to_rfc3339());
        }
        let encoded = encode_event_line(&event)?;
        output.write_all(&encoded).map_err(ReporterError::Write)?;
        output.flush().map_err(ReporterError::Write)?;

        summary.forwarded += 1;
        if event.event == EventKind::End {
            summary.saw_end = true;
        }
    }

    Ok(summary)
}

pub fn endpoint_for_folder(
    folder: &Path,
    interface: InterfaceMode,
    socket_dir: &Path,
) -> Result<Endpoint, ReporterError> {
    let folder = absolute(folder.to_path_buf())?;
    Ok(allocate(&folder, interface, socket_dir)?)
}
