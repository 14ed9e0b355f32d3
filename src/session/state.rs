use std::time::Duration;

use derive_more::Display;
use serde::Serialize;
use serde_with::{DurationMilliSeconds, serde_as};
use strum_macros::Display as StrumDisplay;

use super::scan::ScanStatus;
use crate::error::ConnectError;
use crate::hw::{Peripheral, RadioState};

/// Monotonic counter identifying one connection session.
///
/// Every explicit connect and disconnect advances it, so asynchronous results
/// tagged with an older value can be recognised and discarded.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize,
)]
#[display("#{_0}")]
#[serde(transparent)]
pub struct SessionGeneration(u64);

impl SessionGeneration {
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Coarse connection state without per-state payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

/// Connection state as presented to observers.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected { mtu: Option<u16> },
    #[display("failed: {error}")]
    Failed { error: ConnectError },
    #[display("reconnecting (attempt {attempt})")]
    Reconnecting {
        attempt: u32,
        #[serde(rename = "delay_ms")]
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        delay: Duration,
    },
}

impl ConnectionStatus {
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected { .. } => ConnectionState::Connected,
            Self::Failed { .. } => ConnectionState::Failed,
            Self::Reconnecting { .. } => ConnectionState::Reconnecting,
        }
    }

    /// A session in one of these states blocks a new connect request.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected { .. })
    }
}

/// Point-in-time view of everything the controller owns.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub(crate) radio_state: RadioState,
    pub(crate) permissions_granted: bool,
    pub(crate) scan_status: ScanStatus,
    pub(crate) devices: Vec<Peripheral>,
    pub(crate) peripheral: Option<Peripheral>,
    pub(crate) status: ConnectionStatus,
    pub(crate) generation: SessionGeneration,
    pub(crate) reconnect_attempts: u32,
    pub(crate) auto_reconnect: bool,
    pub(crate) subscription_count: usize,
    pub(crate) notification_count: usize,
}

impl SessionSnapshot {
    #[must_use]
    pub fn radio_state(&self) -> RadioState {
        self.radio_state
    }

    #[must_use]
    pub fn permissions_granted(&self) -> bool {
        self.permissions_granted
    }

    #[must_use]
    pub fn scan_status(&self) -> ScanStatus {
        self.scan_status
    }

    /// Discovered peripherals in first-seen order.
    #[must_use]
    pub fn devices(&self) -> &[Peripheral] {
        &self.devices
    }

    /// The peripheral of the current session, if any.
    #[must_use]
    pub fn peripheral(&self) -> Option<&Peripheral> {
        self.peripheral.as_ref()
    }

    #[must_use]
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    #[must_use]
    pub fn generation(&self) -> SessionGeneration {
        self.generation
    }

    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    #[must_use]
    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscription_count
    }

    #[must_use]
    pub fn notification_count(&self) -> usize {
        self.notification_count
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::disconnected(ConnectionStatus::Disconnected, ConnectionState::Disconnected, false)]
    #[case::connecting(ConnectionStatus::Connecting, ConnectionState::Connecting, true)]
    #[case::connected(ConnectionStatus::Connected { mtu: None }, ConnectionState::Connected, true)]
    #[case::failed(
        ConnectionStatus::Failed { error: ConnectError::PermissionDenied },
        ConnectionState::Failed,
        false
    )]
    #[case::reconnecting(
        ConnectionStatus::Reconnecting { attempt: 1, delay: Duration::from_secs(5) },
        ConnectionState::Reconnecting,
        false
    )]
    fn status_maps_to_state(
        #[case] status: ConnectionStatus,
        #[case] state: ConnectionState,
        #[case] active: bool,
    ) {
        assert_eq!(state, status.state());
        assert_eq!(active, status.is_active());
    }

    #[test]
    fn generations_advance_by_one() {
        let first = SessionGeneration::default().next();
        assert_eq!(1, first.value());
        assert!(first.next() > first);
        assert_eq!("#2", first.next().to_string());
    }

    #[test]
    fn reconnecting_status_serialises_delay_in_milliseconds() {
        let status = ConnectionStatus::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(5),
        };
        let json = serde_json::to_string(&status).expect("status should serialise");
        assert_snapshot!(json, @r#"{"state":"reconnecting","attempt":2,"delay_ms":5000}"#);
    }

    #[test]
    fn failed_status_serialises_error_message() {
        let status = ConnectionStatus::Failed {
            error: ConnectError::ConnectTimeout {
                timeout: Duration::from_secs(15),
            },
        };
        let json = serde_json::to_value(&status).expect("status should serialise");
        assert_eq!("connection attempt timed out after 15s", json["error"]);
        assert_eq!(
            "failed: connection attempt timed out after 15s",
            status.to_string()
        );
    }
}
