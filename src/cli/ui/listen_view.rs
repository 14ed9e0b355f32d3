use std::fmt::{self, Display, Formatter};

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::cli::listen::{ListenStopReason, ListenSummary};
use crate::hw::Peripheral;
use crate::notification::NotificationEvent;
use crate::session::ConnectionStatus;
use crate::utils::{format_hex, short_uuid};

use super::painter::Painter;
use super::table::Table;

const RECEIVED_AT_FORMAT: &[BorrowedFormatItem<'_>] =
    format_description!("[hour]:[minute]:[second].[subsecond digits:3]");

/// Renders the connected peripheral once subscriptions are in place.
pub(crate) struct ListenReadyView<'a> {
    peripheral: &'a Peripheral,
    mtu: Option<u16>,
    subscriptions: usize,
    painter: &'a Painter,
}

impl<'a> ListenReadyView<'a> {
    pub(crate) fn new(
        peripheral: &'a Peripheral,
        mtu: Option<u16>,
        subscriptions: usize,
        painter: &'a Painter,
    ) -> Self {
        Self {
            peripheral,
            mtu,
            subscriptions,
            painter,
        }
    }
}

impl Display for ListenReadyView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let subscriptions = if self.subscriptions == 0 {
            self.painter.caution("none")
        } else {
            self.painter
                .value(format!("{} characteristic(s)", self.subscriptions))
        };
        let mtu = self
            .mtu
            .map_or_else(|| "-".to_string(), |mtu| mtu.to_string());
        let table = Table::fields(
            self.painter,
            vec![
                ("id", self.painter.value(self.peripheral.id().as_str())),
                (
                    "name",
                    self.painter
                        .value(self.peripheral.name().unwrap_or("<unknown>")),
                ),
                ("rssi", self.painter.signal(self.peripheral.rssi())),
                ("mtu", mtu),
                ("subscribed", subscriptions),
            ],
        );

        write!(f, "{}", self.painter.heading("Connected peripheral:"))?;
        write!(f, "\n{table}")
    }
}

/// Renders one notification as a single line.
pub(crate) struct NotificationLineView<'a> {
    event: &'a NotificationEvent,
    painter: &'a Painter,
}

impl<'a> NotificationLineView<'a> {
    pub(crate) fn new(event: &'a NotificationEvent, painter: &'a Painter) -> Self {
        Self { event, painter }
    }
}

impl Display for NotificationLineView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let received_at = self
            .event
            .received_at()
            .format(RECEIVED_AT_FORMAT)
            .map_err(|_error| fmt::Error)?;
        write!(
            f,
            "{} {} {} {}",
            self.painter.muted(format!("[{:04}]", self.event.sequence())),
            self.painter.muted(received_at),
            self.painter
                .value(short_uuid(self.event.characteristic_uuid())),
            format_hex(self.event.value())
        )?;
        if let Some(text) = printable_text(self.event) {
            write!(f, " {}", self.painter.muted(format!("{text:?}")))?;
        }
        Ok(())
    }
}

fn printable_text(event: &NotificationEvent) -> Option<&str> {
    event
        .value_as_text()
        .filter(|text| !text.is_empty() && !text.chars().any(char::is_control))
}

/// Renders a connection status change seen while listening.
pub(crate) struct ConnectionStatusView<'a> {
    status: &'a ConnectionStatus,
    painter: &'a Painter,
}

impl<'a> ConnectionStatusView<'a> {
    pub(crate) fn new(status: &'a ConnectionStatus, painter: &'a Painter) -> Self {
        Self { status, painter }
    }
}

impl Display for ConnectionStatusView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let status = self.status.to_string();
        let status = match self.status {
            ConnectionStatus::Connected { .. } => self.painter.good(status),
            ConnectionStatus::Connecting => self.painter.muted(status),
            ConnectionStatus::Failed { .. } => self.painter.fault(status),
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting { .. } => {
                self.painter.caution(status)
            }
        };
        write!(f, "{} {status}", self.painter.heading("Link:"))
    }
}

/// Renders the listen session summary.
pub(crate) struct ListenSummaryView<'a> {
    summary: &'a ListenSummary,
    painter: &'a Painter,
}

impl<'a> ListenSummaryView<'a> {
    pub(crate) fn new(summary: &'a ListenSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for ListenSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let stop_reason = self.summary.stop_reason().to_string();
        let stop_reason = match self.summary.stop_reason() {
            ListenStopReason::ReachedLimit(_) | ListenStopReason::Interrupted => {
                self.painter.good(stop_reason)
            }
            ListenStopReason::LinkLost => self.painter.fault(stop_reason),
        };
        write!(
            f,
            "{} {} {}",
            self.painter.heading("Stopped:"),
            stop_reason,
            self.painter.value(format!(
                "- received {} notification(s)",
                self.summary.received_notifications()
            ))
        )
    }
}
