use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Args;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cli::command::{OutputFormat, parse_duration};
use crate::hw::{BleAdapter, ScanFilter};
use crate::session::{ScanStatus, SessionConfig, SessionController, SessionEvent, next_matching};
use crate::terminal::TerminalClient;

use super::ui::{DeviceTableView, Painter, Spinner};

/// Arguments for the `scan` command.
#[derive(Debug, Clone, Default, Args)]
pub struct ScanArgs {
    /// How long to scan (e.g. `5s`). Defaults to 20 seconds.
    #[arg(long, value_parser = parse_duration)]
    duration: Option<Duration>,
    /// Only report peripherals advertising this service UUID. Repeatable.
    #[arg(long = "service", value_name = "UUID")]
    services: Vec<String>,
}

impl ScanArgs {
    #[must_use]
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            duration,
            services: Vec::new(),
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::builder()
            .scan_filter(ScanFilter::new(self.services.clone()))
            .build()
    }
}

/// Executes the `scan` command.
pub(crate) async fn run<W>(
    adapter: Arc<dyn BleAdapter>,
    args: &ScanArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()>
where
    W: io::Write,
{
    let controller = SessionController::spawn(adapter, args.session_config())?;
    let mut events = controller.subscribe();
    let spinner = Spinner::start(
        output_format == OutputFormat::Pretty && terminal_client.stderr_is_terminal(),
        "Scanning for peripherals",
    );
    let outcome = scan_window(&controller, &mut events, args.duration, &spinner, interrupt).await;
    spinner.finish();
    let devices = controller.devices().await;
    controller.shutdown().await;
    let outcome = outcome?;

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", DeviceTableView::new(&devices, outcome, &painter))?;
        }
        OutputFormat::Json => {
            for device in &devices {
                writeln!(out, "{}", serde_json::to_string(device)?)?;
            }
        }
    }
    Ok(())
}

/// Runs one scan window, ending early when `interrupt` fires.
#[instrument(skip(controller, events, spinner, interrupt), level = "info")]
async fn scan_window(
    controller: &SessionController,
    events: &mut broadcast::Receiver<SessionEvent>,
    duration: Option<Duration>,
    spinner: &Spinner,
    interrupt: &CancellationToken,
) -> Result<ScanStatus> {
    controller.start_scan(duration).await?;
    let ended = next_matching(events, |event| match event {
        SessionEvent::DeviceListUpdated { devices } => {
            spinner.set_message(format!("Scanning for peripherals ({} found)", devices.len()));
            None
        }
        SessionEvent::ScanStatusChanged { status } if status != ScanStatus::Scanning => {
            Some(status)
        }
        _ => None,
    });

    let status = tokio::select! {
        status = ended => status,
        () = interrupt.cancelled() => {
            controller.stop_scan().await;
            Some(ScanStatus::Stopped)
        }
    };
    status.ok_or_else(|| anyhow!("the session stopped while scanning"))
}
