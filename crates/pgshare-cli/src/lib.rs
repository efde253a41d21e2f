//! Command-line runtime for inspecting and driving shared PostgreSQL servers.
//!
//! The binary is a thin shell over the `pgshare` coordinator. Configuration
//! flags precede the subcommand and are layered by `ortho_config`; the
//! subcommand itself is parsed by `clap`. IO handles are injected so tests can
//! capture output.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use pgshare::socket::DEFAULT_PORT;
use pgshare::telemetry::{self, TelemetryError};
use pgshare::{
    CleanupPolicy, Coordinator, Inspection, LifecycleError, ServerState, StopMode, StopOutcome,
    connection_uri, inspect,
};
use pgshare_config::Config;
use thiserror::Error;

mod config;

use config::{ConfigLoader, OrthoConfigLoader, split_arguments};

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(Arc<ortho_config::OrthoError>),
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error("failed to initialise logging: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("no server is running for '{}'", data_dir.display())]
    NotRunning { data_dir: PathBuf },
    #[error("failed to write output: {0}")]
    Write(#[source] io::Error),
}

#[derive(Debug, Parser)]
#[command(name = "pgshare", version, about = "Share one PostgreSQL server per data directory")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Ensure the server for a data directory is running and print its URI.
    Start {
        /// Data directory, created and initialised when missing.
        data_dir: PathBuf,
    },
    /// Stop the server for a data directory.
    Stop {
        data_dir: PathBuf,
        /// Shutdown mode passed to `pg_ctl`.
        #[arg(long, default_value_t = StopMode::Fast)]
        mode: StopMode,
        /// Stop even while processes still hold the server.
        #[arg(long)]
        force: bool,
    },
    /// Report the server state and registered owners.
    Status { data_dir: PathBuf },
    /// Print the connection URI of a running server.
    Uri {
        data_dir: PathBuf,
        /// Database named in the URI; defaults to the superuser's database.
        #[arg(long)]
        database: Option<String>,
    },
    /// Run SQL through `psql`, starting the server when needed.
    Query { data_dir: PathBuf, sql: String },
}

/// Runs the CLI using the provided arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_loader(args, stdout, stderr, &OrthoConfigLoader)
}

fn run_with_loader<I, W, E, L>(args: I, stdout: &mut W, stderr: &mut E, loader: &L) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
    L: ConfigLoader,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_arguments(&args);

    let cli = match Cli::try_parse_from(&split.command_arguments) {
        Ok(cli) => cli,
        Err(error)
            if matches!(
                error.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = write!(stdout, "{error}");
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            let _ = write!(stderr, "{}", AppError::CliUsage(error));
            return ExitCode::FAILURE;
        }
    };

    let result = loader
        .load(&split.config_arguments)
        .and_then(|config| {
            let _telemetry = telemetry::initialise(&config)?;
            execute(cli.command, config, stdout)
        });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(stderr, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write>(command: CliCommand, config: Config, stdout: &mut W) -> Result<(), AppError> {
    match command {
        CliCommand::Start { data_dir } => {
            let coordinator = Coordinator::new(config)?;
            let handle = coordinator.acquire(&data_dir, CleanupPolicy::None)?;
            writeln!(stdout, "{}", handle.uri(None)).map_err(AppError::Write)?;
            handle.release()?;
        }
        CliCommand::Stop {
            data_dir,
            mode,
            force,
        } => {
            let coordinator = Coordinator::new(config)?;
            let message = match coordinator.stop(&data_dir, mode, force)? {
                StopOutcome::Stopped => "stopped",
                StopOutcome::NotRunning => "not running",
                StopOutcome::Failed(source) => {
                    return Err(LifecycleError::StopFailed { data_dir, source }.into());
                }
            };
            writeln!(stdout, "{message}").map_err(AppError::Write)?;
        }
        CliCommand::Status { data_dir } => {
            let inspection = inspect(&data_dir)?;
            write_inspection(stdout, &inspection).map_err(AppError::Write)?;
        }
        CliCommand::Uri { data_dir, database } => {
            let inspection = inspect(&data_dir)?;
            let uri = running_uri(&config, inspection, database.as_deref())
                .ok_or(AppError::NotRunning { data_dir })?;
            writeln!(stdout, "{uri}").map_err(AppError::Write)?;
        }
        CliCommand::Query { data_dir, sql } => {
            let coordinator = Coordinator::new(config)?;
            let handle = coordinator.acquire(&data_dir, CleanupPolicy::None)?;
            let rows = handle.run_query(&sql)?;
            write!(stdout, "{rows}").map_err(AppError::Write)?;
            handle.release()?;
        }
    }
    Ok(())
}

/// Connection URI of the server described by `inspection`, if it runs.
fn running_uri(config: &Config, inspection: Inspection, database: Option<&str>) -> Option<String> {
    let ServerState::Running(marker) = inspection.state else {
        return None;
    };
    let socket_dir = marker.socket_dir.unwrap_or(inspection.data_dir);
    let port = marker.port.unwrap_or(DEFAULT_PORT);
    let user = config.superuser();
    Some(connection_uri(
        user,
        database.unwrap_or(user),
        &socket_dir,
        port,
    ))
}

fn write_inspection<W: Write>(stdout: &mut W, inspection: &Inspection) -> io::Result<()> {
    writeln!(stdout, "data directory: {}", inspection.data_dir.display())?;
    writeln!(
        stdout,
        "initialised: {}",
        if inspection.initialised { "yes" } else { "no" }
    )?;
    match &inspection.state {
        ServerState::Absent => writeln!(stdout, "state: absent")?,
        ServerState::Running(marker) => {
            writeln!(stdout, "state: running (pid {})", marker.pid)?;
        }
        ServerState::Stale { reason } => writeln!(stdout, "state: stale ({reason})")?,
    }
    let owners: Vec<String> = inspection.owners.iter().map(u32::to_string).collect();
    if owners.is_empty() {
        writeln!(stdout, "owners: none")
    } else {
        writeln!(stdout, "owners: {}", owners.join(", "))
    }
}
