use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use super::adapter::{BleAdapter, DisconnectListener, RadioStateFeed, ScanListener, ValueListener};
use super::model::{
    CharacteristicInfo, ConnectOptions, Peripheral, PeripheralHandle, PeripheralId, RadioState,
    ScanFilter, ScanOptions, ServiceInfo, SubscriptionHandle,
};
use crate::error::{AdapterError, FixtureError};

const FAKE_MAX_MTU: u16 = 247;
const DEFAULT_NOTIFICATION_INTERVAL: Duration = Duration::from_millis(100);

/// Parsed fake scan records in the form `id|name|rssi[|service,service]`.
#[derive(Debug, Clone, Default, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<Peripheral>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Err(FixtureError::EmptyFixture);
        }
        let devices = value
            .split(';')
            .map(parse_scan_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { devices })
    }
}

/// Comma-separated hex payloads the fake pushes on the first notifiable characteristic.
#[derive(Debug, Clone, derive_more::Into)]
pub struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().is_empty() {
            return Ok(Self {
                payloads: Vec::new(),
            });
        }
        let payloads = value
            .split(',')
            .map(parse_hex)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { payloads })
    }
}

/// How the fake answers connection requests.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum FakeConnectBehaviour {
    #[default]
    Succeed,
    /// Never completes; the caller's timeout decides the outcome.
    Hang,
    FailNotFound,
    FailDisconnected,
    FailCancelled,
    FailUnknown,
}

/// A scripted GATT service.
#[derive(Debug, Clone)]
pub struct FakeService {
    service: ServiceInfo,
    characteristics: Vec<CharacteristicInfo>,
}

impl FakeService {
    /// Creates a primary service with `(uuid, properties)` characteristics.
    #[must_use]
    pub fn new(service_uuid: &str, characteristics: &[(&str, &[&str])]) -> Self {
        let characteristics = characteristics
            .iter()
            .map(|(uuid, properties)| {
                CharacteristicInfo::new(
                    service_uuid.to_string(),
                    (*uuid).to_string(),
                    properties.iter().map(ToString::to_string).collect(),
                )
            })
            .collect();
        Self {
            service: ServiceInfo::new(service_uuid.to_string(), true),
            characteristics,
        }
    }
}

/// Settings for a fake adapter.
#[derive(Debug, Builder)]
pub struct FakeAdapterConfig {
    #[builder(default)]
    scan_fixture: ScanFixture,
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    discovery_delay: Duration,
    #[builder(default = DEFAULT_NOTIFICATION_INTERVAL)]
    notification_interval: Duration,
    #[builder(default = RadioState::PoweredOn)]
    radio_state: RadioState,
    #[builder(default = true)]
    permissions_granted: bool,
    #[builder(default)]
    connect_behaviour: FakeConnectBehaviour,
    #[builder(default = default_services())]
    services: Vec<FakeService>,
}

type SharedScanListener = Arc<dyn Fn(Peripheral) + Send + Sync>;
type SharedValueListener = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
type SharedDisconnectListener = Arc<dyn Fn(Option<AdapterError>) + Send + Sync>;

struct FakeScan {
    listener: SharedScanListener,
    task: JoinHandle<()>,
}

enum FakeMonitor {
    Value {
        peripheral: PeripheralId,
        characteristic: String,
        listener: SharedValueListener,
        feeder: Option<JoinHandle<()>>,
    },
    Disconnect {
        peripheral: PeripheralId,
        listener: SharedDisconnectListener,
    },
}

#[derive(Default)]
struct FakeState {
    known: HashSet<PeripheralId>,
    connected: HashSet<PeripheralId>,
    permissions_granted: bool,
    connect_behaviour: FakeConnectBehaviour,
    discovery_fails: bool,
    failing_characteristics: HashSet<String>,
    scan: Option<FakeScan>,
    monitors: HashMap<u64, FakeMonitor>,
    next_handle: u64,
    released: usize,
    double_releases: usize,
    connect_calls: Vec<PeripheralId>,
    cancelled: Vec<PeripheralId>,
    last_connect_options: Option<ConnectOptions>,
}

/// Scripted adapter used by tests and hardware-free runs.
pub struct FakeAdapter {
    radio: RadioStateFeed,
    devices: Vec<Peripheral>,
    services: Vec<FakeService>,
    payloads: Vec<Vec<u8>>,
    discovery_delay: Duration,
    notification_interval: Duration,
    state: Mutex<FakeState>,
}

impl fmt::Debug for FakeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeAdapter")
            .field("radio", &self.radio.current())
            .field("devices", &self.devices.len())
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

impl FakeAdapter {
    #[must_use]
    pub fn new(config: FakeAdapterConfig) -> Self {
        let FakeAdapterConfig {
            scan_fixture,
            notifications,
            discovery_delay,
            notification_interval,
            radio_state,
            permissions_granted,
            connect_behaviour,
            services,
        } = config;
        let devices: Vec<Peripheral> = scan_fixture.into();
        let state = FakeState {
            known: devices.iter().map(|device| device.id().clone()).collect(),
            permissions_granted,
            connect_behaviour,
            ..FakeState::default()
        };

        Self {
            radio: RadioStateFeed::new(radio_state),
            devices,
            services,
            payloads: notifications.map(Into::into).unwrap_or_default(),
            discovery_delay,
            notification_interval,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the radio to `state`, notifying every subscriber of the transition.
    pub fn set_radio_state(&self, state: RadioState) {
        self.radio.publish(state);
    }

    pub fn set_permissions_granted(&self, granted: bool) {
        self.state().permissions_granted = granted;
    }

    pub fn set_connect_behaviour(&self, behaviour: FakeConnectBehaviour) {
        self.state().connect_behaviour = behaviour;
    }

    pub fn set_discovery_failure(&self, fails: bool) {
        self.state().discovery_fails = fails;
    }

    /// Makes subscribing to `characteristic_uuid` fail.
    pub fn fail_subscription(&self, characteristic_uuid: &str) {
        self.state()
            .failing_characteristics
            .insert(characteristic_uuid.to_string());
    }

    /// Marks a peripheral as already linked before any connect request.
    pub fn mark_connected(&self, id: &PeripheralId) {
        let mut state = self.state();
        state.known.insert(id.clone());
        state.connected.insert(id.clone());
    }

    /// Delivers an advertisement to the running scan. Returns `false` when not scanning.
    pub fn emit_discovery(&self, peripheral: Peripheral) -> bool {
        let listener = {
            let mut state = self.state();
            state.known.insert(peripheral.id().clone());
            state.scan.as_ref().map(|scan| Arc::clone(&scan.listener))
        };
        match listener {
            Some(listener) => {
                listener(peripheral);
                true
            }
            None => false,
        }
    }

    /// Pushes `value` to every monitor of `characteristic_uuid`. Returns the number of monitors reached.
    pub fn emit_notification(&self, characteristic_uuid: &str, value: &[u8]) -> usize {
        let listeners: Vec<SharedValueListener> = self
            .state()
            .monitors
            .values()
            .filter_map(|monitor| match monitor {
                FakeMonitor::Value {
                    characteristic,
                    listener,
                    ..
                } if characteristic.eq_ignore_ascii_case(characteristic_uuid) => {
                    Some(Arc::clone(listener))
                }
                _ => None,
            })
            .collect();
        for listener in &listeners {
            listener(value.to_vec());
        }
        listeners.len()
    }

    /// Simulates the peripheral dropping the link. Returns the number of disconnect monitors fired.
    pub fn disconnect_peripheral(&self, id: &PeripheralId) -> usize {
        let listeners: Vec<SharedDisconnectListener> = {
            let mut state = self.state();
            state.connected.remove(id);
            state
                .monitors
                .values()
                .filter_map(|monitor| match monitor {
                    FakeMonitor::Disconnect {
                        peripheral,
                        listener,
                    } if peripheral == id => Some(Arc::clone(listener)),
                    _ => None,
                })
                .collect()
        };
        for listener in &listeners {
            listener(None);
        }
        listeners.len()
    }

    /// Returns the number of live characteristic monitors.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.state()
            .monitors
            .values()
            .filter(|monitor| matches!(monitor, FakeMonitor::Value { .. }))
            .count()
    }

    /// Returns the number of live disconnect monitors.
    #[must_use]
    pub fn active_disconnect_monitors(&self) -> usize {
        self.state()
            .monitors
            .values()
            .filter(|monitor| matches!(monitor, FakeMonitor::Disconnect { .. }))
            .count()
    }

    #[must_use]
    pub fn released_subscriptions(&self) -> usize {
        self.state().released
    }

    /// Returns how many removals named a handle that was not active.
    #[must_use]
    pub fn double_releases(&self) -> usize {
        self.state().double_releases
    }

    #[must_use]
    pub fn connect_calls(&self) -> Vec<PeripheralId> {
        self.state().connect_calls.clone()
    }

    #[must_use]
    pub fn cancelled_connections(&self) -> Vec<PeripheralId> {
        self.state().cancelled.clone()
    }

    #[must_use]
    pub fn last_connect_options(&self) -> Option<ConnectOptions> {
        self.state().last_connect_options.clone()
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.state().scan.is_some()
    }

    fn services_for(&self, peripheral: &PeripheralHandle) -> Result<&[FakeService], AdapterError> {
        if !self.state().connected.contains(peripheral.id()) {
            return Err(AdapterError::NotConnected {
                id: peripheral.id().clone(),
            });
        }
        Ok(&self.services)
    }

    fn scripted_characteristic(&self) -> Option<&str> {
        self.services
            .iter()
            .flat_map(|service| &service.characteristics)
            .find(|characteristic| characteristic.is_notifiable())
            .map(CharacteristicInfo::uuid)
    }

    fn spawn_feeder(&self, listener: SharedValueListener) -> JoinHandle<()> {
        let payloads = self.payloads.clone();
        let interval = self.notification_interval;
        tokio::spawn(async move {
            for payload in payloads {
                sleep(interval).await;
                listener(payload);
            }
        })
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    fn radio_state(&self) -> RadioState {
        self.radio.current()
    }

    fn radio_transitions(&self) -> broadcast::Receiver<RadioState> {
        self.radio.subscribe()
    }

    async fn request_permissions(&self) -> Result<bool, AdapterError> {
        Ok(self.state().permissions_granted)
    }

    #[instrument(skip(self, on_result), level = "debug")]
    async fn start_scan(
        &self,
        filter: ScanFilter,
        options: ScanOptions,
        on_result: ScanListener,
    ) -> Result<(), AdapterError> {
        let listener: SharedScanListener = Arc::from(on_result);
        let devices: Vec<Peripheral> = self
            .devices
            .iter()
            .filter(|device| matches_filter(device, &filter))
            .cloned()
            .collect();
        let delay = self.discovery_delay;
        let emitter = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            for device in devices {
                emitter(device);
            }
        });

        if let Some(previous) = self.state().scan.replace(FakeScan { listener, task }) {
            previous.task.abort();
        }
        info!("fake scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        if let Some(scan) = self.state().scan.take() {
            scan.task.abort();
            debug!("fake scan stopped");
        }
        Ok(())
    }

    async fn connected_peripheral(
        &self,
        id: &PeripheralId,
    ) -> Result<Option<PeripheralHandle>, AdapterError> {
        let connected = self.state().connected.contains(id);
        Ok(connected.then(|| PeripheralHandle::new(id.clone(), None)))
    }

    #[instrument(skip(self, options), level = "debug", fields(peripheral_id = %id))]
    async fn connect(
        &self,
        id: &PeripheralId,
        options: ConnectOptions,
    ) -> Result<PeripheralHandle, AdapterError> {
        let behaviour = {
            let mut state = self.state();
            state.connect_calls.push(id.clone());
            state.last_connect_options = Some(options.clone());
            state.connect_behaviour
        };

        match behaviour {
            FakeConnectBehaviour::Succeed => {
                let mut state = self.state();
                if !state.known.contains(id) {
                    return Err(AdapterError::UnknownPeripheral { id: id.clone() });
                }
                state.connected.insert(id.clone());
                Ok(PeripheralHandle::new(
                    id.clone(),
                    Some(options.mtu().min(FAKE_MAX_MTU)),
                ))
            }
            FakeConnectBehaviour::Hang => std::future::pending().await,
            FakeConnectBehaviour::FailNotFound => {
                Err(AdapterError::UnknownPeripheral { id: id.clone() })
            }
            FakeConnectBehaviour::FailDisconnected => Err(AdapterError::Disconnected),
            FakeConnectBehaviour::FailCancelled => Err(AdapterError::Cancelled),
            FakeConnectBehaviour::FailUnknown => Err(AdapterError::Injected {
                message: "fake adapter refused the connection".to_string(),
            }),
        }
    }

    async fn discover_services_and_characteristics(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<(), AdapterError> {
        self.services_for(peripheral)?;
        if self.state().discovery_fails {
            return Err(AdapterError::Injected {
                message: "fake service discovery failed".to_string(),
            });
        }
        Ok(())
    }

    async fn list_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<ServiceInfo>, AdapterError> {
        Ok(self
            .services_for(peripheral)?
            .iter()
            .map(|service| service.service.clone())
            .collect())
    }

    async fn list_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: &ServiceInfo,
    ) -> Result<Vec<CharacteristicInfo>, AdapterError> {
        Ok(self
            .services_for(peripheral)?
            .iter()
            .filter(|candidate| candidate.service.uuid() == service.uuid())
            .flat_map(|candidate| candidate.characteristics.iter().cloned())
            .collect())
    }

    #[instrument(
        skip(self, peripheral, on_value),
        level = "debug",
        fields(characteristic = characteristic.uuid())
    )]
    async fn monitor_characteristic(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicInfo,
        on_value: ValueListener,
    ) -> Result<SubscriptionHandle, AdapterError> {
        self.services_for(peripheral)?;
        let listener: SharedValueListener = Arc::from(on_value);
        let feeder = (self.scripted_characteristic() == Some(characteristic.uuid())
            && !self.payloads.is_empty())
        .then(|| self.spawn_feeder(Arc::clone(&listener)));

        let mut state = self.state();
        if state.failing_characteristics.contains(characteristic.uuid()) {
            if let Some(feeder) = feeder {
                feeder.abort();
            }
            return Err(AdapterError::Injected {
                message: format!("fake subscription to {} failed", characteristic.uuid()),
            });
        }
        state.next_handle += 1;
        let id = state.next_handle;
        state.monitors.insert(
            id,
            FakeMonitor::Value {
                peripheral: peripheral.id().clone(),
                characteristic: characteristic.uuid().to_string(),
                listener,
                feeder,
            },
        );
        Ok(SubscriptionHandle::new(id))
    }

    async fn monitor_disconnection(
        &self,
        peripheral: &PeripheralHandle,
        on_disconnect: DisconnectListener,
    ) -> Result<SubscriptionHandle, AdapterError> {
        let mut state = self.state();
        state.next_handle += 1;
        let id = state.next_handle;
        state.monitors.insert(
            id,
            FakeMonitor::Disconnect {
                peripheral: peripheral.id().clone(),
                listener: Arc::from(on_disconnect),
            },
        );
        Ok(SubscriptionHandle::new(id))
    }

    async fn remove_subscription(&self, handle: SubscriptionHandle) -> Result<(), AdapterError> {
        let mut state = self.state();
        let Some(monitor) = state.monitors.remove(&handle.id()) else {
            state.double_releases += 1;
            return Err(AdapterError::UnknownSubscription {
                handle: handle.to_string(),
            });
        };
        state.released += 1;
        if let FakeMonitor::Value {
            feeder: Some(feeder),
            peripheral,
            ..
        } = monitor
        {
            debug!(peripheral_id = %peripheral, "stopping scripted notifications");
            feeder.abort();
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), AdapterError> {
        let mut state = self.state();
        state.cancelled.push(id.clone());
        state.connected.remove(id);
        Ok(())
    }
}

fn matches_filter(device: &Peripheral, filter: &ScanFilter) -> bool {
    filter.service_uuids().is_empty()
        || filter
            .service_uuids()
            .iter()
            .any(|uuid| device.service_uuids().contains(uuid))
}

fn parse_scan_record(raw_record: &str) -> Result<Peripheral, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if !(3..=4).contains(&fields.len()) {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields[..3].iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let name = (fields[1] != "-").then(|| fields[1].to_string());
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };
    let service_uuids: BTreeSet<String> = fields
        .get(3)
        .map(|services| {
            services
                .split(',')
                .map(str::trim)
                .filter(|uuid| !uuid.is_empty())
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default();

    Ok(Peripheral::builder()
        .id(fields[0])
        .maybe_name(name)
        .maybe_rssi(rssi)
        .service_uuids(service_uuids)
        .build())
}

fn parse_hex(raw_value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = raw_value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).map_err(|source| FixtureError::InvalidHex {
        value: cleaned,
        source,
    })
}

/// Heart-rate and battery services, both with one notifiable characteristic.
fn default_services() -> Vec<FakeService> {
    let heart_rate = uuid16(0x180d);
    let measurement = uuid16(0x2a37);
    let body_location = uuid16(0x2a38);
    let battery = uuid16(0x180f);
    let battery_level = uuid16(0x2a19);

    vec![
        FakeService::new(
            &heart_rate,
            &[
                (measurement.as_str(), &["notify"][..]),
                (body_location.as_str(), &["read"][..]),
            ],
        ),
        FakeService::new(&battery, &[(battery_level.as_str(), &["read", "notify"][..])]),
    ]
}

/// Expands a 16-bit assigned number into the lowercase Bluetooth base UUID.
#[must_use]
pub fn uuid16(short: u16) -> String {
    format!("0000{short:04x}-0000-1000-8000-00805f9b34fb")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("AA:BB|HRM|-43", 1)]
    #[case("AA:BB|HRM|-43;CC:DD|-|-|0000180d-0000-1000-8000-00805f9b34fb", 2)]
    fn scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let fixture: ScanFixture = fixture.parse().expect("fixture should parse");
        let devices: Vec<Peripheral> = fixture.into();
        assert_eq!(expected_count, devices.len());
    }

    #[test]
    fn scan_fixture_treats_dash_as_absent() {
        let fixture: ScanFixture = "CC:DD|-|-".parse().expect("fixture should parse");
        let devices: Vec<Peripheral> = fixture.into();
        assert_eq!(None, devices[0].name());
        assert_eq!(None, devices[0].rssi());
    }

    #[rstest]
    #[case::too_few("AA:BB|HRM")]
    #[case::too_many("AA:BB|HRM|-43|180d|extra")]
    fn scan_fixture_rejects_invalid_field_count(#[case] fixture: &str) {
        assert_matches!(
            fixture.parse::<ScanFixture>(),
            Err(FixtureError::InvalidRecordFieldCount)
        );
    }

    #[test]
    fn notification_payloads_reject_odd_length_hex() {
        assert_matches!(
            "0A0".parse::<NotificationPayloads>(),
            Err(FixtureError::InvalidHex { .. })
        );
    }

    #[test]
    fn connect_behaviour_parses_kebab_case() {
        let behaviour: FakeConnectBehaviour = "fail-disconnected".parse().expect("should parse");
        assert_eq!(FakeConnectBehaviour::FailDisconnected, behaviour);
    }

    #[tokio::test]
    async fn removing_a_handle_twice_is_counted() -> anyhow::Result<()> {
        let adapter = FakeAdapter::new(
            FakeAdapterConfig::builder()
                .scan_fixture("AA:BB|HRM|-43".parse()?)
                .build(),
        );
        let handle = adapter
            .connect(
                &PeripheralId::from("AA:BB"),
                ConnectOptions::builder()
                    .mtu(512)
                    .timeout(Duration::from_secs(1))
                    .build(),
            )
            .await?;
        let first = adapter
            .monitor_disconnection(&handle, Box::new(|_cause: Option<AdapterError>| {}))
            .await?;
        let id = first.id();
        adapter.remove_subscription(first).await?;

        let second = adapter.remove_subscription(SubscriptionHandle::new(id)).await;

        assert_matches!(second, Err(AdapterError::UnknownSubscription { .. }));
        assert_eq!(1, adapter.released_subscriptions());
        assert_eq!(1, adapter.double_releases());
        Ok(())
    }
}
