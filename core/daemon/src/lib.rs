//! Per-folder test telemetry hub.
//!
//! One listener per workspace folder accepts reporter connections. Each
//! connection drives a `Session` that turns the reporter's event stream into
//! signals, and every session ends with exactly one `Closed` signal.

pub mod commands;
pub mod config;
mod connection;
pub mod console;
pub mod diagnostics;
pub mod error;
pub mod hub;
pub mod registry;
pub mod router;
pub mod session;
pub mod status;

pub use config::{load_config, HubConfig};
pub use error::{CommandError, ConfigError, RegistryError};
pub use hub::Hub;
pub use registry::{ListenerSettings, ReconcileReport, RemoteInfo, RemoteRegistry};
pub use router::{NotificationRouter, RecordingSink, SignalSink};
pub use session::{RunOutcome, RunStats, Session, SessionPhase, SessionSignal};
