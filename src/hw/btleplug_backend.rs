use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, PeripheralProperties,
};
use btleplug::platform::{Adapter, Manager, Peripheral as BtlePeripheral};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::adapter::{BleAdapter, DisconnectListener, RadioStateFeed, ScanListener, ValueListener};
use super::model::{
    CharacteristicInfo, ConnectOptions, Peripheral, PeripheralHandle, PeripheralId, RadioState,
    ScanFilter, ScanOptions, ServiceInfo, SubscriptionHandle,
};
use crate::error::AdapterError;

type PeripheralCache = Arc<Mutex<HashMap<PeripheralId, BtlePeripheral>>>;

#[derive(Debug)]
struct Monitor {
    task: JoinHandle<()>,
    peripheral: BtlePeripheral,
    characteristic: Option<Characteristic>,
}

/// Adapter backed by the first `btleplug` adapter on the host.
#[derive(Debug)]
pub(crate) struct BtleplugAdapter {
    adapter: Adapter,
    radio: Arc<RadioStateFeed>,
    peripherals: PeripheralCache,
    monitors: Mutex<HashMap<u64, Monitor>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    radio_task: JoinHandle<()>,
    next_handle: AtomicU64,
}

impl BtleplugAdapter {
    /// Opens the host's first BLE adapter and starts tracking its power state.
    #[instrument(level = "debug")]
    pub(crate) async fn new() -> Result<Self, AdapterError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(AdapterError::NoAdapters)?;
        match adapter.adapter_info().await {
            Ok(name) => info!(adapter = %name, "using BLE adapter"),
            Err(error) => debug!(?error, "failed to describe BLE adapter"),
        }

        let initial = match adapter.adapter_state().await {
            Ok(state) => radio_state(state),
            Err(error) => {
                debug!(?error, "adapter state unavailable, assuming unknown");
                RadioState::Unknown
            }
        };
        let radio = Arc::new(RadioStateFeed::new(initial));
        let mut events = adapter.events().await?;
        let radio_task = tokio::spawn({
            let radio = Arc::clone(&radio);
            async move {
                while let Some(event) = events.next().await {
                    if let CentralEvent::StateUpdate(state) = event {
                        let state = radio_state(state);
                        if radio.publish(state) {
                            debug!(%state, "radio state changed");
                        }
                    }
                }
            }
        });

        Ok(Self {
            adapter,
            radio,
            peripherals: Arc::default(),
            monitors: Mutex::default(),
            scan_task: Mutex::default(),
            radio_task,
            next_handle: AtomicU64::new(0),
        })
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<u64, Monitor>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replace_scan_task(&self, task: Option<JoinHandle<()>>) {
        let previous = {
            let mut slot = self.scan_task.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Resolves an id from the scan cache, falling back to the adapter's peripheral list.
    async fn peripheral(&self, id: &PeripheralId) -> Result<BtlePeripheral, AdapterError> {
        if let Some(peripheral) = cache(&self.peripherals).get(id) {
            return Ok(peripheral.clone());
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|candidate| candidate.id().to_string() == id.as_str())
            .ok_or_else(|| AdapterError::UnknownPeripheral { id: id.clone() })?;
        cache(&self.peripherals).insert(id.clone(), peripheral.clone());
        Ok(peripheral)
    }

    fn register(&self, monitor: Monitor) -> SubscriptionHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        self.monitors().insert(id, monitor);
        SubscriptionHandle::new(id)
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.radio_task.abort();
        self.replace_scan_task(None);
        for (_id, monitor) in self.monitors().drain() {
            monitor.task.abort();
        }
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    fn radio_state(&self) -> RadioState {
        self.radio.current()
    }

    fn radio_transitions(&self) -> broadcast::Receiver<RadioState> {
        self.radio.subscribe()
    }

    async fn request_permissions(&self) -> Result<bool, AdapterError> {
        // Desktop stacks grant access at the OS level; there is no runtime prompt.
        Ok(true)
    }

    #[instrument(skip(self, on_result), level = "debug")]
    async fn start_scan(
        &self,
        filter: ScanFilter,
        options: ScanOptions,
        on_result: ScanListener,
    ) -> Result<(), AdapterError> {
        let services = filter
            .service_uuids()
            .iter()
            .map(|value| {
                Uuid::from_str(value).map_err(|source| AdapterError::InvalidUuid {
                    value: value.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(btleplug::api::ScanFilter { services })
            .await?;

        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    continue;
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(peripheral) => peripheral,
                    Err(error) => {
                        trace!(?error, "discovered peripheral vanished");
                        continue;
                    }
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let found = peripheral_from_properties(&peripheral, &properties);
                cache(&peripherals).insert(found.id().clone(), peripheral);
                on_result(found);
            }
        });
        self.replace_scan_task(Some(task));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        self.replace_scan_task(None);
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connected_peripheral(
        &self,
        id: &PeripheralId,
    ) -> Result<Option<PeripheralHandle>, AdapterError> {
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await? {
            return Ok(Some(PeripheralHandle::new(id.clone(), None)));
        }
        Ok(None)
    }

    #[instrument(skip(self, options), level = "debug", fields(peripheral_id = %id))]
    async fn connect(
        &self,
        id: &PeripheralId,
        options: ConnectOptions,
    ) -> Result<PeripheralHandle, AdapterError> {
        let peripheral = self.peripheral(id).await?;
        debug!(
            requested_mtu = options.mtu(),
            auto_connect = options.auto_connect(),
            "btleplug negotiates MTU internally; request is advisory"
        );
        peripheral.connect().await?;
        Ok(PeripheralHandle::new(id.clone(), None))
    }

    #[instrument(skip(self), level = "debug", fields(peripheral_id = %peripheral.id()))]
    async fn discover_services_and_characteristics(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<(), AdapterError> {
        self.peripheral(peripheral.id())
            .await?
            .discover_services()
            .await?;
        Ok(())
    }

    async fn list_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<ServiceInfo>, AdapterError> {
        let mut services: Vec<ServiceInfo> = self
            .peripheral(peripheral.id())
            .await?
            .services()
            .into_iter()
            .map(|service| ServiceInfo::new(service.uuid.to_string(), service.primary))
            .collect();
        services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
        Ok(services)
    }

    async fn list_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, AdapterError> {
        let mut characteristics: Vec<CharacteristicInfo> = self
            .peripheral(peripheral.id())
            .await?
            .services()
            .into_iter()
            .filter(|candidate| candidate.uuid.to_string() == service.uuid())
            .flat_map(|candidate| candidate.characteristics)
            .map(|characteristic| {
                CharacteristicInfo::new(
                    service.uuid().to_string(),
                    characteristic.uuid.to_string(),
                    property_labels(characteristic.properties),
                )
            })
            .collect();
        characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));
        Ok(characteristics)
    }

    #[instrument(
        skip(self, peripheral, on_value),
        level = "debug",
        fields(peripheral_id = %peripheral.id(), characteristic = characteristic.uuid())
    )]
    async fn monitor_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicInfo,
        on_value: ValueListener,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let target = self.peripheral(peripheral.id()).await?;
        let resolved = target
            .characteristics()
            .into_iter()
            .find(|candidate| {
                candidate.uuid.to_string() == characteristic.uuid()
                    && candidate.service_uuid.to_string() == characteristic.service_uuid()
            })
            .ok_or_else(|| AdapterError::UnknownCharacteristic {
                uuid: characteristic.uuid().to_string(),
            })?;

        let mut notifications = target.notifications().await?;
        target.subscribe(&resolved).await?;

        let uuid = resolved.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    on_value(notification.value);
                }
            }
        });

        Ok(self.register(Monitor {
            task,
            peripheral: target,
            characteristic: Some(resolved),
        }))
    }

    #[instrument(skip(self, on_disconnect), level = "debug", fields(peripheral_id = %peripheral.id()))]
    async fn monitor_disconnection(
        &self,
        peripheral: &PeripheralHandle,
        on_disconnect: DisconnectListener,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let target = self.peripheral(peripheral.id()).await?;
        let mut events = self.adapter.events().await?;
        let target_id = target.id();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event
                    && id == target_id
                {
                    on_disconnect(None);
                    break;
                }
            }
        });

        Ok(self.register(Monitor {
            task,
            peripheral: target,
            characteristic: None,
        }))
    }

    async fn remove_subscription(&self, handle: SubscriptionHandle) -> Result<(), AdapterError> {
        let monitor = self.monitors().remove(&handle.id());
        let Some(Monitor {
            task,
            peripheral,
            characteristic,
        }) = monitor
        else {
            return Err(AdapterError::UnknownSubscription {
                handle: handle.to_string(),
            });
        };

        task.abort();
        if let Some(characteristic) = characteristic
            && peripheral.is_connected().await?
        {
            peripheral.unsubscribe(&characteristic).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(peripheral_id = %id))]
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), AdapterError> {
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        } else {
            warn!("no established link to cancel");
        }
        Ok(())
    }
}

fn cache(peripherals: &PeripheralCache) -> MutexGuard<'_, HashMap<PeripheralId, BtlePeripheral>> {
    peripherals.lock().unwrap_or_else(PoisonError::into_inner)
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

fn peripheral_from_properties(
    peripheral: &BtlePeripheral,
    properties: &PeripheralProperties,
) -> Peripheral {
    Peripheral::builder()
        .id(peripheral.id().to_string())
        .maybe_name(properties.local_name.clone())
        .maybe_rssi(properties.rssi)
        .service_uuids(
            properties
                .services
                .iter()
                .map(ToString::to_string)
                .collect(),
        )
        .build()
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    flags
        .iter_names()
        .map(|(name, _flag)| name.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::notify(CharPropFlags::NOTIFY, vec!["notify"])]
    #[case::read_indicate(CharPropFlags::READ | CharPropFlags::INDICATE, vec!["read", "indicate"])]
    #[case::empty(CharPropFlags::empty(), vec![])]
    fn property_labels_are_lowercase_flag_names(
        #[case] flags: CharPropFlags,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(expected, property_labels(flags));
    }

    #[rstest]
    #[case::on(CentralState::PoweredOn, RadioState::PoweredOn)]
    #[case::off(CentralState::PoweredOff, RadioState::PoweredOff)]
    #[case::unknown(CentralState::Unknown, RadioState::Unknown)]
    fn central_state_maps_to_radio_state(#[case] state: CentralState, #[case] expected: RadioState) {
        assert_eq!(expected, radio_state(state));
    }
}
