use std::time::Duration;

use serde_with::SerializeDisplay;
use thiserror::Error;

use crate::hw::{PeripheralId, RadioState};

/// Errors reported by an adapter backend.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peripheral `{id}` is not known to the adapter")]
    UnknownPeripheral { id: PeripheralId },
    #[error("characteristic `{uuid}` is not exposed by the peripheral")]
    UnknownCharacteristic { uuid: String },
    #[error("peripheral `{id}` is not connected")]
    NotConnected { id: PeripheralId },
    #[error("the peripheral disconnected")]
    Disconnected,
    #[error("the operation was cancelled")]
    Cancelled,
    #[error("the operation timed out")]
    TimedOut,
    #[error("invalid service UUID `{value}` in scan filter")]
    InvalidUuid {
        value: String,
        source: uuid::Error,
    },
    #[error("{handle} is not active")]
    UnknownSubscription { handle: String },
    #[error("{message}")]
    Injected { message: String },
}

/// Classified failure of a connection attempt.
#[derive(Debug, Clone, Eq, PartialEq, Error, SerializeDisplay)]
pub enum ConnectError {
    #[error("bluetooth is not ready (radio is {state})")]
    AdapterNotReady { state: RadioState },
    #[error("bluetooth permissions were not granted")]
    PermissionDenied,
    #[error(
        "connection attempt timed out after {}",
        humantime::format_duration(*timeout)
    )]
    ConnectTimeout { timeout: Duration },
    #[error("peripheral `{id}` was not found")]
    DeviceNotFound { id: PeripheralId },
    #[error("the peripheral disconnected during connection setup")]
    DeviceDisconnectedDuringSetup,
    #[error("the connection attempt was cancelled")]
    OperationCancelled,
    #[error("service discovery failed: {reason}")]
    ServiceDiscoveryFailed { reason: String },
    #[error("adapter error: {reason}")]
    UnknownAdapterError { reason: String },
    #[error("a session with `{current}` is already connecting or connected")]
    Busy { current: PeripheralId },
    #[error("the session controller has stopped")]
    ControllerStopped,
}

impl ConnectError {
    /// Classifies a failure returned by the adapter's connect request.
    pub(crate) fn from_connect_failure(error: &AdapterError, timeout: Duration) -> Self {
        match error {
            AdapterError::UnknownPeripheral { id } => Self::DeviceNotFound { id: id.clone() },
            AdapterError::TimedOut => Self::ConnectTimeout { timeout },
            AdapterError::Cancelled => Self::OperationCancelled,
            AdapterError::Disconnected => Self::DeviceDisconnectedDuringSetup,
            other => Self::UnknownAdapterError {
                reason: error_chain(other),
            },
        }
    }

    /// Classifies a failure returned while discovering services.
    pub(crate) fn from_discovery_failure(error: &AdapterError) -> Self {
        match error {
            AdapterError::Cancelled => Self::OperationCancelled,
            AdapterError::Disconnected | AdapterError::NotConnected { .. } => {
                Self::DeviceDisconnectedDuringSetup
            }
            other => Self::ServiceDiscoveryFailed {
                reason: error_chain(other),
            },
        }
    }

    /// Returns whether the failure was a user cancellation, which never triggers a reconnect.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::OperationCancelled)
    }
}

/// Errors returned when starting a scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("bluetooth is not ready (radio is {state})")]
    AdapterNotReady { state: RadioState },
    #[error("bluetooth permissions were not granted")]
    PermissionDenied,
    #[error("the adapter rejected the scan request")]
    Adapter(#[from] AdapterError),
    #[error("the session controller has stopped")]
    ControllerStopped,
}

/// Errors raised while attaching notification subscriptions.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to enumerate services of `{peripheral}`")]
    EnumerationFailed {
        peripheral: PeripheralId,
        source: AdapterError,
    },
    #[error("failed to subscribe to characteristic `{characteristic}`")]
    SubscriptionFailed {
        characteristic: String,
        source: AdapterError,
    },
}

/// Errors returned when parsing fake adapter fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain three or four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid hex payload `{value}`")]
    InvalidHex {
        value: String,
        source: hex::FromHexError,
    },
}

/// Errors returned when validating runtime options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
    #[error("`{name}` must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("`{name}` must be greater than zero")]
    ZeroCapacity { name: &'static str },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[rstest]
    #[case::timed_out(AdapterError::TimedOut, ConnectError::ConnectTimeout { timeout: TIMEOUT })]
    #[case::cancelled(AdapterError::Cancelled, ConnectError::OperationCancelled)]
    #[case::disconnected(AdapterError::Disconnected, ConnectError::DeviceDisconnectedDuringSetup)]
    #[case::unknown_peripheral(
        AdapterError::UnknownPeripheral { id: "AA:BB".into() },
        ConnectError::DeviceNotFound { id: "AA:BB".into() }
    )]
    fn connect_failures_are_classified(#[case] error: AdapterError, #[case] expected: ConnectError) {
        assert_eq!(expected, ConnectError::from_connect_failure(&error, TIMEOUT));
    }

    #[test]
    fn unclassified_connect_failures_keep_the_adapter_message() {
        let error = AdapterError::Injected {
            message: "radio busy".into(),
        };
        assert_matches!(
            ConnectError::from_connect_failure(&error, TIMEOUT),
            ConnectError::UnknownAdapterError { reason } if reason == "radio busy"
        );
    }

    #[rstest]
    #[case::disconnected(AdapterError::Disconnected, ConnectError::DeviceDisconnectedDuringSetup)]
    #[case::not_connected(
        AdapterError::NotConnected { id: "AA:BB".into() },
        ConnectError::DeviceDisconnectedDuringSetup
    )]
    #[case::cancelled(AdapterError::Cancelled, ConnectError::OperationCancelled)]
    fn discovery_failures_are_classified(#[case] error: AdapterError, #[case] expected: ConnectError) {
        assert_eq!(expected, ConnectError::from_discovery_failure(&error));
    }

    #[test]
    fn only_cancellation_suppresses_reconnect() {
        assert!(ConnectError::OperationCancelled.is_cancellation());
        assert!(!ConnectError::ConnectTimeout { timeout: TIMEOUT }.is_cancellation());
        assert!(!ConnectError::DeviceDisconnectedDuringSetup.is_cancellation());
    }

    #[test]
    fn timeout_message_uses_human_duration() {
        let error = ConnectError::ConnectTimeout { timeout: TIMEOUT };
        assert_eq!("connection attempt timed out after 15s", error.to_string());
    }

    #[test]
    fn connect_error_serialises_as_its_message() {
        let json = serde_json::to_string(&ConnectError::PermissionDenied)
            .expect("connect errors should serialise");
        assert_eq!("\"bluetooth permissions were not granted\"", json);
    }
}
