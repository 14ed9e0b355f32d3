use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::Args;
use derive_more::Display;
use owo_colors::OwoColorize;
use periph_macros::progress;
use serde::Serialize;
use serde_with::SerializeDisplay;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cli::command::{OutputFormat, parse_duration};
use crate::hw::{BleAdapter, Peripheral, PeripheralId};
use crate::notification::NotificationEvent;
use crate::session::{
    ConnectionStatus, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY, DEFAULT_SCAN_DURATION,
    ScanStatus, SessionConfig, SessionController, SessionEvent, SessionSnapshot,
    next_connection_status, next_matching,
};
use crate::terminal::TerminalClient;

use super::ui::{
    ConnectionStatusView, ListenReadyView, ListenSummaryView, NotificationLineView, Painter,
};

/// Arguments for the `listen` command.
#[derive(Debug, Clone, Args)]
pub struct ListenArgs {
    /// Peripheral id, or the start of its advertised name.
    #[arg(long)]
    device: String,
    /// Stop after this many notifications. If omitted, listen until Ctrl+C.
    #[arg(long)]
    max_notifications: Option<usize>,
    /// Reconnect after failed attempts and dropped links.
    #[arg(long)]
    auto_reconnect: bool,
    /// Per-attempt connection timeout.
    #[arg(long, value_parser = parse_duration, default_value = "15s")]
    connect_timeout: Duration,
    /// Pause before each reconnection attempt.
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    reconnect_delay: Duration,
    /// How long to scan for the device before giving up.
    #[arg(long, value_parser = parse_duration, default_value = "20s")]
    scan_duration: Duration,
}

impl ListenArgs {
    /// Creates listen arguments for `device` with default timings.
    #[must_use]
    pub fn new(device: impl Into<String>, max_notifications: Option<usize>) -> Self {
        Self {
            device: device.into(),
            max_notifications,
            auto_reconnect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            scan_duration: DEFAULT_SCAN_DURATION,
        }
    }

    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::builder()
            .scan_duration(self.scan_duration)
            .connect_timeout(self.connect_timeout)
            .reconnect_delay(self.reconnect_delay)
            .auto_reconnect(self.auto_reconnect)
            .build()
    }
}

/// Why a listen session ended.
#[derive(Debug, Clone, Eq, PartialEq, Display, SerializeDisplay)]
pub(crate) enum ListenStopReason {
    #[display("reached max notifications ({_0})")]
    ReachedLimit(usize),
    #[display("interrupted by user")]
    Interrupted,
    #[display("link lost")]
    LinkLost,
}

/// Outcome of one listen session.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct ListenSummary {
    peripheral_id: PeripheralId,
    received_notifications: usize,
    stop_reason: ListenStopReason,
}

impl ListenSummary {
    pub(crate) fn new(
        peripheral_id: PeripheralId,
        received_notifications: usize,
        stop_reason: ListenStopReason,
    ) -> Self {
        Self {
            peripheral_id,
            received_notifications,
            stop_reason,
        }
    }

    pub(crate) fn received_notifications(&self) -> usize {
        self.received_notifications
    }

    pub(crate) fn stop_reason(&self) -> &ListenStopReason {
        &self.stop_reason
    }
}

enum ListenUpdate {
    Notification(NotificationEvent),
    Status(ConnectionStatus),
    Abandoned,
}

/// Writes listen output in the selected format.
struct ListenOutput<'a, W> {
    out: &'a mut W,
    painter: Painter,
    format: OutputFormat,
}

impl<W: io::Write> ListenOutput<'_, W> {
    fn ready(&mut self, peripheral: &Peripheral, snapshot: &SessionSnapshot) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            return Ok(());
        }
        let mtu = match snapshot.status() {
            ConnectionStatus::Connected { mtu } => *mtu,
            _ => None,
        };
        let view = ListenReadyView::new(
            peripheral,
            mtu,
            snapshot.subscription_count(),
            &self.painter,
        );
        writeln!(self.out, "{view}")
    }

    fn notification(&mut self, event: &NotificationEvent) -> Result<()> {
        match self.format {
            OutputFormat::Pretty => {
                writeln!(self.out, "{}", NotificationLineView::new(event, &self.painter))?;
            }
            OutputFormat::Json => writeln!(self.out, "{}", serde_json::to_string(event)?)?,
        }
        Ok(())
    }

    fn status(&mut self, status: &ConnectionStatus) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            return Ok(());
        }
        writeln!(self.out, "{}", ConnectionStatusView::new(status, &self.painter))
    }

    fn summary(&mut self, summary: &ListenSummary) -> Result<()> {
        match self.format {
            OutputFormat::Pretty => {
                writeln!(self.out)?;
                writeln!(self.out, "{}", ListenSummaryView::new(summary, &self.painter))?;
            }
            OutputFormat::Json => writeln!(self.out, "{}", serde_json::to_string(summary)?)?,
        }
        Ok(())
    }
}

/// Executes the `listen` command.
pub(crate) async fn run<W>(
    adapter: Arc<dyn BleAdapter>,
    args: &ListenArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
    interrupt: &CancellationToken,
) -> Result<()>
where
    W: io::Write,
{
    let mut output = ListenOutput {
        out,
        painter: Painter::new(terminal_client.stdout_is_terminal()),
        format: output_format,
    };
    let controller = SessionController::spawn(adapter, args.session_config())?;
    let mut events = controller.subscribe();

    let result = listen(&controller, &mut events, args, &mut output, interrupt).await;
    controller.disconnect().await;
    controller.shutdown().await;

    output.summary(&result?)
}

async fn listen<W: io::Write>(
    controller: &SessionController,
    events: &mut broadcast::Receiver<SessionEvent>,
    args: &ListenArgs,
    output: &mut ListenOutput<'_, W>,
    interrupt: &CancellationToken,
) -> Result<ListenSummary> {
    let peripheral = tokio::select! {
        found = find_peripheral(controller, events, &args.device) => found?,
        () = interrupt.cancelled() => bail!("interrupted before `{}` was found", args.device),
    };
    let peripheral_id = peripheral.id().clone();

    let snapshot = tokio::select! {
        connected = connect(controller, events, peripheral.clone(), args.auto_reconnect) => connected?,
        () = interrupt.cancelled() => {
            return Ok(ListenSummary::new(peripheral_id, 0, ListenStopReason::Interrupted));
        }
    };
    output.ready(&peripheral, &snapshot)?;

    let mut received = 0_usize;
    let stop_reason = loop {
        let update = tokio::select! {
            biased;
            () = interrupt.cancelled() => break ListenStopReason::Interrupted,
            update = next_matching(events, listen_update) => update,
        };
        match update {
            Some(ListenUpdate::Notification(event)) => {
                received += 1;
                output.notification(&event)?;
                if let Some(limit) = args.max_notifications
                    && received >= limit
                {
                    break ListenStopReason::ReachedLimit(limit);
                }
            }
            Some(ListenUpdate::Status(status)) => {
                output.status(&status)?;
                let lost = matches!(
                    status,
                    ConnectionStatus::Disconnected | ConnectionStatus::Failed { .. }
                );
                if lost && !args.auto_reconnect {
                    break ListenStopReason::LinkLost;
                }
            }
            Some(ListenUpdate::Abandoned) | None => break ListenStopReason::LinkLost,
        }
    };

    Ok(ListenSummary::new(peripheral_id, received, stop_reason))
}

fn listen_update(event: SessionEvent) -> Option<ListenUpdate> {
    match event {
        SessionEvent::NotificationReceived { event } => Some(ListenUpdate::Notification(event)),
        SessionEvent::ConnectionStatusChanged { status, .. } => Some(ListenUpdate::Status(status)),
        SessionEvent::ReconnectAbandoned { .. } => Some(ListenUpdate::Abandoned),
        _ => None,
    }
}

/// Scans until a peripheral matching `selector` shows up.
#[instrument(skip(controller, events), level = "info")]
async fn find_peripheral(
    controller: &SessionController,
    events: &mut broadcast::Receiver<SessionEvent>,
    selector: &str,
) -> Result<Peripheral> {
    controller.start_scan(None).await?;
    let found = next_matching(events, |event| match event {
        SessionEvent::DeviceListUpdated { devices } => devices
            .into_iter()
            .find(|device| device.matches_selector(selector))
            .map(Some),
        SessionEvent::ScanStatusChanged { status } if status != ScanStatus::Scanning => Some(None),
        _ => None,
    })
    .await
    .flatten();

    found.ok_or_else(|| anyhow!("no peripheral matching `{selector}` was found"))
}

/// Connects and waits until the link is up and subscriptions are attached.
#[progress(
    message = "Connecting",
    finished = format!("{} Connected", "✓".green()),
    failed = format!("{} Connection failed", "✗".red()),
)]
#[instrument(
    skip(controller, events, peripheral),
    level = "info",
    fields(peripheral_id = %peripheral.id())
)]
async fn connect(
    controller: &SessionController,
    events: &mut broadcast::Receiver<SessionEvent>,
    peripheral: Peripheral,
    auto_reconnect: bool,
) -> Result<SessionSnapshot> {
    controller.connect(peripheral).await?;
    loop {
        match next_connection_status(events).await {
            Some(ConnectionStatus::Connected { .. }) => break,
            Some(ConnectionStatus::Failed { error }) if !auto_reconnect => {
                return Err(error.into());
            }
            Some(_) => {}
            None => bail!("the session stopped while connecting"),
        }
    }
    controller
        .snapshot()
        .await
        .ok_or_else(|| anyhow!("the session stopped after connecting"))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cli::{Args, Command};

    #[test]
    fn timings_default_to_session_defaults() {
        let args = Args::try_parse_from(["periph", "listen", "--device", "Heart"])
            .expect("listen arguments should parse");
        let Command::Listen(listen) = args.into_command_and_fake_args().expect("no fake mode").0
        else {
            panic!("expected the listen command");
        };

        let config = listen.session_config();
        assert_eq!(DEFAULT_SCAN_DURATION, config.scan_duration());
        assert_eq!(DEFAULT_CONNECT_TIMEOUT, config.connect_timeout());
        assert_eq!(DEFAULT_RECONNECT_DELAY, config.reconnect_delay());
        assert!(!config.auto_reconnect());
    }

    #[test]
    fn summary_serialises_the_stop_reason_as_text() {
        let summary = ListenSummary::new(
            PeripheralId::from("AA:BB"),
            3,
            ListenStopReason::ReachedLimit(3),
        );

        insta::assert_snapshot!(
            serde_json::to_string(&summary).expect("summary serialises"),
            @r#"{"peripheral_id":"AA:BB","received_notifications":3,"stop_reason":"reached max notifications (3)"}"#
        );
    }
}
