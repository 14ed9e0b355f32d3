use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::model::{
    CharacteristicInfo, ConnectOptions, Peripheral, PeripheralHandle, PeripheralId, RadioState,
    ScanFilter, ScanOptions, ServiceInfo, SubscriptionHandle,
};
use crate::error::AdapterError;

/// Receives each advertisement seen while a scan is running.
pub type ScanListener = Box<dyn Fn(Peripheral) + Send + Sync>;

/// Receives each value pushed by a monitored characteristic.
pub type ValueListener = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Receives a peripheral-initiated disconnect, with the cause when the backend reports one.
pub type DisconnectListener = Box<dyn Fn(Option<AdapterError>) + Send + Sync>;

/// Capability surface the session core drives.
///
/// Implementations own the radio transport. Listener callbacks may be invoked
/// from any task and must not block.
#[async_trait]
pub trait BleAdapter: Send + Sync + Debug {
    /// Returns the current radio state.
    fn radio_state(&self) -> RadioState;

    /// Returns a receiver that yields each radio state transition made after
    /// this call, in order. Rapid flaps are not merged.
    fn radio_transitions(&self) -> broadcast::Receiver<RadioState>;

    /// Asks the platform for the permissions scanning and connecting need.
    async fn request_permissions(&self) -> Result<bool, AdapterError>;

    async fn start_scan(
        &self,
        filter: ScanFilter,
        options: ScanOptions,
        on_result: ScanListener,
    ) -> Result<(), AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    /// Returns a handle when the peripheral already has an established link.
    async fn connected_peripheral(
        &self,
        id: &PeripheralId,
    ) -> Result<Option<PeripheralHandle>, AdapterError>;

    async fn connect(
        &self,
        id: &PeripheralId,
        options: ConnectOptions,
    ) -> Result<PeripheralHandle, AdapterError>;

    async fn discover_services_and_characteristics(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<(), AdapterError>;

    async fn list_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<ServiceInfo>, AdapterError>;

    async fn list_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, AdapterError>;

    async fn monitor_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicInfo,
        on_value: ValueListener,
    ) -> Result<SubscriptionHandle, AdapterError>;

    /// Watches for the link to `peripheral` dropping. Released through
    /// [`BleAdapter::remove_subscription`].
    async fn monitor_disconnection(
        &self,
        peripheral: &PeripheralHandle,
        on_disconnect: DisconnectListener,
    ) -> Result<SubscriptionHandle, AdapterError>;

    async fn remove_subscription(&self, handle: SubscriptionHandle) -> Result<(), AdapterError>;

    /// Terminates the link, or the pending connection request, for `id`.
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), AdapterError>;
}

const RADIO_FEED_CAPACITY: usize = 16;

/// The last known radio state plus an ordered feed of every change to it.
#[derive(Debug)]
pub(crate) struct RadioStateFeed {
    current: Mutex<RadioState>,
    transitions: broadcast::Sender<RadioState>,
}

impl RadioStateFeed {
    pub(crate) fn new(initial: RadioState) -> Self {
        let (transitions, _) = broadcast::channel(RADIO_FEED_CAPACITY);
        Self {
            current: Mutex::new(initial),
            transitions,
        }
    }

    pub(crate) fn current(&self) -> RadioState {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `state` and publishes it. Returns `false` when nothing changed.
    pub(crate) fn publish(&self, state: RadioState) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == state {
            return false;
        }
        *current = state;
        // Sent under the lock so subscribers see transitions in the order `current` took them.
        let _ = self.transitions.send(state);
        true
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RadioState> {
        self.transitions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn feed_keeps_every_transition_in_order() {
        let feed = RadioStateFeed::new(RadioState::PoweredOn);
        let mut transitions = feed.subscribe();

        assert!(feed.publish(RadioState::PoweredOff));
        assert!(feed.publish(RadioState::PoweredOn));
        assert!(!feed.publish(RadioState::PoweredOn));

        assert_eq!(Ok(RadioState::PoweredOff), transitions.try_recv());
        assert_eq!(Ok(RadioState::PoweredOn), transitions.try_recv());
        assert!(transitions.try_recv().is_err());
        assert_eq!(RadioState::PoweredOn, feed.current());
    }
}
