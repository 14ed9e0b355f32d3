use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::error::{SubscriptionError, error_chain};
use crate::hw::{BleAdapter, CharacteristicInfo, PeripheralHandle, SubscriptionHandle, ValueListener};
use crate::notification::{NotificationEvent, NotificationLog};

/// A characteristic monitor registered with the adapter.
#[derive(Debug)]
pub struct ActiveSubscription {
    characteristic: CharacteristicInfo,
    handle: SubscriptionHandle,
}

impl ActiveSubscription {
    #[must_use]
    pub fn characteristic(&self) -> &CharacteristicInfo {
        &self.characteristic
    }
}

/// Subscribes to every notifiable characteristic of `peripheral`.
///
/// A characteristic whose subscription fails is logged and skipped. The
/// returned subscriptions belong to the caller until adopted or released.
///
/// # Errors
///
/// Fails only when the services themselves cannot be listed.
#[instrument(skip_all, fields(peripheral_id = %peripheral.id()))]
pub async fn subscribe_all<F>(
    adapter: &dyn BleAdapter,
    peripheral: &PeripheralHandle,
    mut listener_for: F,
) -> Result<Vec<ActiveSubscription>, SubscriptionError>
where
    F: FnMut(&CharacteristicInfo) -> ValueListener + Send,
{
    let services = adapter.list_services(peripheral).await.map_err(|source| {
        SubscriptionError::EnumerationFailed {
            peripheral: peripheral.id().clone(),
            source,
        }
    })?;

    let mut attached = Vec::new();
    for service in &services {
        let characteristics = match adapter.list_characteristics(peripheral, service).await {
            Ok(characteristics) => characteristics,
            Err(error) => {
                warn!(
                    service = service.uuid(),
                    error = %error_chain(&error),
                    "skipping service whose characteristics could not be listed"
                );
                continue;
            }
        };

        for characteristic in characteristics
            .into_iter()
            .filter(CharacteristicInfo::is_notifiable)
        {
            let listener = listener_for(&characteristic);
            match adapter
                .monitor_characteristic(peripheral, &characteristic, listener)
                .await
            {
                Ok(handle) => {
                    debug!(characteristic = characteristic.uuid(), %handle, "subscribed");
                    attached.push(ActiveSubscription {
                        characteristic,
                        handle,
                    });
                }
                Err(source) => {
                    let error = SubscriptionError::SubscriptionFailed {
                        characteristic: characteristic.uuid().to_string(),
                        source,
                    };
                    warn!(error = %error_chain(&error), "skipping characteristic");
                }
            }
        }
    }

    info!(attached = attached.len(), "notification subscriptions attached");
    Ok(attached)
}

/// Hands each subscription back to the adapter. Returns how many it accepted.
pub async fn release_all(adapter: &dyn BleAdapter, subscriptions: Vec<ActiveSubscription>) -> usize {
    let mut released = 0;
    for ActiveSubscription {
        characteristic,
        handle,
    } in subscriptions
    {
        match adapter.remove_subscription(handle).await {
            Ok(()) => released += 1,
            Err(error) => warn!(
                characteristic = characteristic.uuid(),
                error = %error_chain(&error),
                "failed to release subscription"
            ),
        }
    }
    if released > 0 {
        debug!(released, "subscriptions released");
    }
    released
}

/// Tracks the characteristic monitors of the connected peripheral.
///
/// Handles are moved out on release, so each one is handed back to the
/// adapter exactly once no matter how often [`Self::detach_all`] runs.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    active: Vec<ActiveSubscription>,
    last_sequence: u64,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes over `subscriptions`, releasing any left from a previous link
    /// first. Returns the number now live.
    pub async fn adopt(
        &mut self,
        adapter: &dyn BleAdapter,
        subscriptions: Vec<ActiveSubscription>,
    ) -> usize {
        if !self.active.is_empty() {
            warn!(
                live = self.active.len(),
                "releasing subscriptions left from a previous link"
            );
            self.detach_all(adapter).await;
        }
        self.active = subscriptions;
        self.active.len()
    }

    /// Releases every live subscription. Returns how many the adapter accepted.
    pub async fn detach_all(&mut self, adapter: &dyn BleAdapter) -> usize {
        release_all(adapter, std::mem::take(&mut self.active)).await
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.active.len()
    }

    /// Stamps a received value with the next sequence id and prepends it to `log`.
    ///
    /// Sequence ids keep increasing across log clears and reconnects.
    pub fn record(
        &mut self,
        log: &mut NotificationLog,
        service_uuid: String,
        characteristic_uuid: String,
        value: Vec<u8>,
        received_at: OffsetDateTime,
    ) -> NotificationEvent {
        self.last_sequence += 1;
        let event = NotificationEvent::new(
            self.last_sequence,
            service_uuid,
            characteristic_uuid,
            value,
            received_at,
        );
        log.push(event.clone());
        event
    }
}
