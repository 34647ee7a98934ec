//! ide-mocha-reporter: forwards a test run to the ide-mocha hub.
//!
//! ## Subcommands
//!
//! - `endpoint`: print the address the hub uses for a folder
//! - `send`: read test events from stdin and forward them to the hub

mod client;
mod error;
mod logging;
mod translate;

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ide_mocha_protocol::address::default_socket_dir;
use ide_mocha_protocol::InterfaceMode;

use client::{endpoint_for_folder, forward, resolve_endpoint, HubConnection, Target};
use error::ReporterError;
use translate::InputFormat;

#[derive(Parser)]
#[command(name = "ide-mocha-reporter")]
#[command(about = "Forward mocha test events to the ide-mocha hub")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hub address for a folder
    Endpoint {
        /// Workspace folder (defaults to the current directory)
        #[arg(value_name = "FOLDER")]
        folder: Option<PathBuf>,

        #[command(flatten)]
        location: Location,
    },

    /// Forward test events read from stdin
    Send {
        /// Hub address: a socket path or a TCP port. Overrides IDE_MOCHA_ADDRESS.
        #[arg(long)]
        address: Option<String>,

        /// Workspace folder whose hub should receive the run
        #[arg(long)]
        folder: Option<PathBuf>,

        /// Input line format
        #[arg(long, value_enum, default_value_t = InputFormat::Events)]
        format: InputFormat,

        #[command(flatten)]
        location: Location,
    },
}

#[derive(clap::Args)]
struct Location {
    /// Interface mode the hub uses: local-socket or ip
    #[arg(long, default_value = "local-socket")]
    interface: String,

    /// Directory holding the hub's socket files
    #[arg(long, value_name = "DIR")]
    socket_dir: Option<PathBuf>,
}

impl Location {
    fn resolve(self) -> Result<(InterfaceMode, PathBuf), ReporterError> {
        let interface = self.interface.parse()?;
        Ok((interface, self.socket_dir.unwrap_or_else(default_socket_dir)))
    }
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Endpoint { folder, location } => print_endpoint(folder, location),
        Commands::Send {
            address,
            folder,
            format,
            location,
        } => send(address, folder, format, location),
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "ide-mocha-reporter failed");
        eprintln!("ide-mocha-reporter: {}", err);
        std::process::exit(1);
    }
}

fn print_endpoint(folder: Option<PathBuf>, location: Location) -> Result<(), ReporterError> {
    let (interface, socket_dir) = location.resolve()?;
    let folder = match folder {
        Some(folder) => folder,
        None => std::env::current_dir().map_err(ReporterError::CurrentDir)?,
    };
    let endpoint = endpoint_for_folder(&folder, interface, &socket_dir)?;
    println!("{}", endpoint);
    Ok(())
}

fn send(
    address: Option<String>,
    folder: Option<PathBuf>,
    format: InputFormat,
    location: Location,
) -> Result<(), ReporterError> {
    let (interface, socket_dir) = location.resolve()?;
    let endpoint = resolve_endpoint(&Target {
        address,
        folder,
        interface,
        socket_dir,
    })?;

    let mut connection = HubConnection::connect(&endpoint)?;
    tracing::debug!(endpoint = %endpoint, "Connected to hub");

    let summary = forward(io::stdin().lock(), &mut connection, format)?;
    tracing::info!(
        forwarded = summary.forwarded,
        skipped = summary.skipped,
        "Run forwarded"
    );
    if !summary.saw_end {
        tracing::warn!("Input ended before the run finished; the hub will record it as aborted");
    }
    Ok(())
}
