use std::io;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat};
use crate::hw::AdapterBackend;
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Selects the system Bluetooth adapter.
#[must_use]
pub fn real_backend() -> AdapterBackend {
    AdapterBackend::Real
}

/// Selects the fixture-driven fake adapter.
#[must_use]
pub fn fake_backend(fake_args: FakeArgs) -> AdapterBackend {
    AdapterBackend::Fake(fake_args.into_adapter_config())
}

/// Runs a CLI command against `backend` with pretty output.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = periph::Args::try_parse_from([
///     "periph",
///     "--fake",
///     "--fake-scan",
///     "AA:BB|Heart Strap|-48",
///     "scan",
///     "--duration",
///     "1s",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => periph::fake_backend(fake_args),
///     None => periph::real_backend(),
/// };
/// let mut out = Vec::new();
/// periph::run(command, &mut out, backend).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the adapter cannot be
/// opened, the command fails, or output writing fails.
pub async fn run<W>(command: Command, out: &mut W, backend: AdapterBackend) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, out, backend, None, OutputFormat::Pretty).await
}

/// Runs a CLI command with an explicit log level and output format.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the adapter cannot be
/// opened, the command fails, or output writing fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    backend: AdapterBackend,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(
        command,
        out,
        &SystemTerminalClient,
        backend,
        log_level,
        output_format,
    )
    .await
}

/// Runs a CLI command with an injected terminal client.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the adapter cannot be
/// opened, the command fails, or output writing fails.
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    backend: AdapterBackend,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(
        command,
        out,
        terminal_client,
        backend,
        None,
        OutputFormat::Pretty,
    )
    .await
}

/// Runs a CLI command with injected clients and explicit telemetry settings.
///
/// Ctrl+C ends a running scan or listen session early; the command still
/// writes its result.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct PlainTerminal;
/// impl periph::TerminalClient for PlainTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = periph::Args::try_parse_from([
///     "periph",
///     "--log-level",
///     "trace",
///     "--fake",
///     "--fake-scan",
///     "AA:BB|Heart Strap|-48",
///     "--fake-notifications",
///     "0648",
///     "listen",
///     "--device",
///     "Heart",
///     "--max-notifications",
///     "1",
/// ])?;
/// let log_level = args.log_level();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => periph::fake_backend(fake_args),
///     None => periph::real_backend(),
/// };
/// let mut out = Vec::new();
/// periph::run_with_clients_and_log_level(
///     command,
///     &mut out,
///     &PlainTerminal,
///     backend,
///     log_level,
///     periph::OutputFormat::Json,
/// ).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the adapter cannot be
/// opened, the command fails, or output writing fails.
#[instrument(
    skip(out, terminal_client, backend),
    level = "info",
    fields(command = %command.name(), ?log_level, ?output_format)
)]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    backend: AdapterBackend,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "periph",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    let adapter = backend.open().await?;
    let interrupt = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_ctrl_c(interrupt.clone()));

    let result = match command {
        Command::Scan(args) => {
            crate::cli::scan::run(
                adapter,
                &args,
                out,
                terminal_client,
                output_format,
                &interrupt,
            )
            .await
        }
        Command::Listen(args) => {
            crate::cli::listen::run(
                adapter,
                &args,
                out,
                terminal_client,
                output_format,
                &interrupt,
            )
            .await
        }
    };
    watcher.abort();
    result
}

async fn cancel_on_ctrl_c(interrupt: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            debug!("interrupt received");
            interrupt.cancel();
        }
        Err(error) => debug!(%error, "cannot listen for Ctrl+C"),
    }
}
