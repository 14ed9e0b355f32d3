use std::time::Duration;

use serde::Serialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::scan::ScanStatus;
use super::state::{ConnectionStatus, SessionGeneration};
use crate::hw::{Peripheral, PeripheralId, RadioState};
use crate::notification::NotificationEvent;

/// Observable change in a session, in the order the controller applied it.
#[serde_as]
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    ReadinessChanged {
        radio_state: RadioState,
        permissions_granted: bool,
    },
    ScanStatusChanged {
        status: ScanStatus,
    },
    DeviceListUpdated {
        devices: Vec<Peripheral>,
    },
    ConnectionStatusChanged {
        peripheral_id: Option<PeripheralId>,
        generation: SessionGeneration,
        status: ConnectionStatus,
    },
    SubscriptionsAttached {
        peripheral_id: PeripheralId,
        count: usize,
    },
    NotificationReceived {
        event: NotificationEvent,
    },
    NotificationLogCleared,
    ReconnectScheduled {
        peripheral_id: PeripheralId,
        attempt: u32,
        #[serde(rename = "delay_ms")]
        #[serde_as(as = "DurationMilliSeconds<u64>")]
        delay: Duration,
    },
    ReconnectAbandoned {
        peripheral_id: PeripheralId,
        attempts: u32,
    },
}

/// Fans session events out to any number of observers.
///
/// Slow observers lose the oldest events rather than stalling the session.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: SessionEvent) {
        // No observers is fine.
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Waits for the first event `select` maps to a value, skipping over lag.
///
/// Returns `None` once the controller has shut down.
pub async fn next_matching<T>(
    receiver: &mut broadcast::Receiver<SessionEvent>,
    mut select: impl FnMut(SessionEvent) -> Option<T>,
) -> Option<T> {
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let Some(value) = select(event) {
                    return Some(value);
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "session observer lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Waits for the next connection status change.
pub async fn next_connection_status(
    receiver: &mut broadcast::Receiver<SessionEvent>,
) -> Option<ConnectionStatus> {
    next_matching(receiver, |event| match event {
        SessionEvent::ConnectionStatusChanged { status, .. } => Some(status),
        _ => None,
    })
    .await
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn next_matching_skips_unrelated_events() {
        let dispatcher = EventDispatcher::new(8);
        let mut receiver = dispatcher.subscribe();

        dispatcher.send(SessionEvent::NotificationLogCleared);
        dispatcher.send(SessionEvent::ScanStatusChanged {
            status: ScanStatus::Scanning,
        });

        let status = next_matching(&mut receiver, |event| match event {
            SessionEvent::ScanStatusChanged { status } => Some(status),
            _ => None,
        })
        .await;
        assert_eq!(Some(ScanStatus::Scanning), status);
    }

    #[tokio::test]
    async fn next_matching_survives_lag() {
        let dispatcher = EventDispatcher::new(2);
        let mut receiver = dispatcher.subscribe();

        for _ in 0..4 {
            dispatcher.send(SessionEvent::NotificationLogCleared);
        }
        dispatcher.send(SessionEvent::ConnectionStatusChanged {
            peripheral_id: None,
            generation: SessionGeneration::default(),
            status: ConnectionStatus::Disconnected,
        });

        assert_eq!(
            Some(ConnectionStatus::Disconnected),
            next_connection_status(&mut receiver).await
        );
    }

    #[tokio::test]
    async fn next_matching_ends_when_dispatcher_is_gone() {
        let dispatcher = EventDispatcher::new(2);
        let mut receiver = dispatcher.subscribe();
        drop(dispatcher);

        assert_eq!(None, next_connection_status(&mut receiver).await);
    }

    #[test]
    fn events_serialise_with_a_type_tag() {
        let event = SessionEvent::ScanStatusChanged {
            status: ScanStatus::BluetoothUnavailable,
        };
        let json = serde_json::to_string(&event).expect("event should serialise");
        assert_snapshot!(json, @r#"{"type":"scan_status_changed","status":"bluetooth_unavailable"}"#);
    }
}
