use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use periph::{
    ConnectError, FakeAdapter, FakeAdapterConfig, Peripheral, RadioState, ScanError, ScanFilter,
    ScanStatus, SessionConfig, SessionController, SessionEvent, next_matching, uuid16,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast::Receiver;
use tokio::time::{Instant, sleep, timeout};

const PATIENCE: Duration = Duration::from_secs(300);
const TWO_SENSORS: &str = "AA:BB|Heart Strap|-48|0000180d-0000-1000-8000-00805f9b34fb;CC:DD|-|-";

fn fake_adapter() -> Arc<FakeAdapter> {
    Arc::new(FakeAdapter::new(
        FakeAdapterConfig::builder()
            .scan_fixture(TWO_SENSORS.parse().expect("fixture should parse"))
            .build(),
    ))
}

fn start(
    fake: &Arc<FakeAdapter>,
    config: SessionConfig,
) -> (SessionController, Receiver<SessionEvent>) {
    let controller =
        SessionController::spawn(fake.clone(), config).expect("config should validate");
    let events = controller.subscribe();
    (controller, events)
}

async fn wait_for<T>(
    events: &mut Receiver<SessionEvent>,
    pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    timeout(PATIENCE, next_matching(events, pick))
        .await
        .expect("event should arrive in time")
        .expect("session should still be running")
}

async fn wait_for_devices(events: &mut Receiver<SessionEvent>, count: usize) -> Vec<Peripheral> {
    wait_for(events, |event| match event {
        SessionEvent::DeviceListUpdated { devices } if devices.len() == count => Some(devices),
        _ => None,
    })
    .await
}

async fn wait_for_scan_status(events: &mut Receiver<SessionEvent>, wanted: ScanStatus) {
    wait_for(events, |event| match event {
        SessionEvent::ScanStatusChanged { status } if status == wanted => Some(()),
        _ => None,
    })
    .await;
}

fn ids(devices: &[Peripheral]) -> Vec<&str> {
    devices.iter().map(|device| device.id().as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn repeated_sightings_refresh_entries_in_place() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    controller.start_scan(None).await.expect("scan should start");
    wait_for_devices(&mut events, 2).await;

    let refreshed = Peripheral::builder()
        .id("AA:BB")
        .name("Heart Strap".to_string())
        .rssi(-40)
        .build();
    assert!(fake.emit_discovery(refreshed));
    let devices = wait_for(&mut events, |event| match event {
        SessionEvent::DeviceListUpdated { devices }
            if devices.first().and_then(Peripheral::rssi) == Some(-40) =>
        {
            Some(devices)
        }
        _ => None,
    })
    .await;

    assert_eq!(vec!["AA:BB", "CC:DD"], ids(&devices));
    assert_eq!(2, controller.devices().await.len());
}

#[tokio::test(start_paused = true)]
async fn scan_finishes_when_the_window_elapses() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    let started = Instant::now();

    controller
        .start_scan(Some(Duration::from_secs(5)))
        .await
        .expect("scan should start");
    wait_for_scan_status(&mut events, ScanStatus::Finished).await;

    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(!fake.is_scanning());
    let snapshot = controller.snapshot().await.expect("session is running");
    assert_eq!(ScanStatus::Finished, snapshot.scan_status());
    assert_eq!(2, snapshot.devices().len());
}

#[tokio::test(start_paused = true)]
async fn default_window_comes_from_the_config() {
    let fake = fake_adapter();
    let config = SessionConfig::builder()
        .scan_duration(Duration::from_secs(3))
        .build();
    let (controller, mut events) = start(&fake, config);
    let started = Instant::now();

    controller.start_scan(None).await.expect("scan should start");
    wait_for_scan_status(&mut events, ScanStatus::Finished).await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn stopping_cancels_the_window() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    controller
        .start_scan(Some(Duration::from_secs(10)))
        .await
        .expect("scan should start");

    assert!(controller.stop_scan().await);
    assert!(!controller.stop_scan().await);
    sleep(Duration::from_secs(30)).await;

    let snapshot = controller.snapshot().await.expect("session is running");
    assert_eq!(ScanStatus::Stopped, snapshot.scan_status());
    assert!(!fake.is_scanning());
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::ScanStatusChanged { status } = event {
            statuses.push(status);
        }
    }
    assert_eq!(vec![ScanStatus::Scanning, ScanStatus::Stopped], statuses);
}

#[tokio::test(start_paused = true)]
async fn restarting_clears_the_previous_results() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    controller.start_scan(None).await.expect("scan should start");
    wait_for_devices(&mut events, 2).await;

    controller.start_scan(None).await.expect("scan should restart");

    assert!(wait_for_devices(&mut events, 0).await.is_empty());
    wait_for_devices(&mut events, 2).await;
    assert!(fake.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn service_filter_limits_results() {
    let fake = fake_adapter();
    let config = SessionConfig::builder()
        .scan_filter(ScanFilter::new(vec![uuid16(0x180d)]))
        .scan_duration(Duration::from_secs(2))
        .build();
    let (controller, mut events) = start(&fake, config);

    controller.start_scan(None).await.expect("scan should start");
    wait_for_scan_status(&mut events, ScanStatus::Finished).await;

    assert_eq!(vec!["AA:BB"], ids(&controller.devices().await));
}

#[tokio::test(start_paused = true)]
async fn radio_loss_stops_the_scan_but_keeps_the_devices() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    controller.start_scan(None).await.expect("scan should start");
    wait_for_devices(&mut events, 2).await;

    fake.set_radio_state(RadioState::PoweredOff);
    wait_for_scan_status(&mut events, ScanStatus::BluetoothUnavailable).await;

    assert_eq!(vec!["AA:BB", "CC:DD"], ids(&controller.devices().await));
    assert!(!fake.is_scanning());
    assert_matches!(
        controller.start_scan(None).await,
        Err(ScanError::AdapterNotReady {
            state: RadioState::PoweredOff
        })
    );
    assert_matches!(
        controller.connect_by_id("AA:BB").await,
        Err(ConnectError::AdapterNotReady {
            state: RadioState::PoweredOff
        })
    );

    fake.set_radio_state(RadioState::PoweredOn);
    wait_for_scan_status(&mut events, ScanStatus::Idle).await;
    controller.start_scan(None).await.expect("scan should start again");
}

#[tokio::test(start_paused = true)]
async fn radio_flap_still_stops_the_scan() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    controller.start_scan(None).await.expect("scan should start");
    wait_for_devices(&mut events, 2).await;

    fake.set_radio_state(RadioState::PoweredOff);
    fake.set_radio_state(RadioState::PoweredOn);
    wait_for_scan_status(&mut events, ScanStatus::BluetoothUnavailable).await;
    sleep(Duration::from_secs(1)).await;

    let snapshot = controller.snapshot().await.expect("session is running");
    assert_ne!(ScanStatus::Scanning, snapshot.scan_status());
    assert_eq!(RadioState::PoweredOn, snapshot.radio_state());
    assert!(!fake.is_scanning());
    assert_eq!(vec!["AA:BB", "CC:DD"], ids(&controller.devices().await));
}

#[tokio::test(start_paused = true)]
async fn readiness_changes_are_published() {
    let fake = fake_adapter();
    let (controller, mut events) = start(&fake, SessionConfig::default());
    controller.snapshot().await.expect("session is running");

    fake.set_radio_state(RadioState::PoweredOff);
    let permissions_granted = wait_for(&mut events, |event| match event {
        SessionEvent::ReadinessChanged {
            radio_state: RadioState::PoweredOff,
            permissions_granted,
        } => Some(permissions_granted),
        _ => None,
    })
    .await;

    assert!(permissions_granted);
    let snapshot = controller.snapshot().await.expect("session is running");
    assert_eq!(RadioState::PoweredOff, snapshot.radio_state());
    assert_eq!(ScanStatus::BluetoothUnavailable, snapshot.scan_status());
}

#[tokio::test(start_paused = true)]
async fn missing_permissions_block_scanning() {
    let fake = Arc::new(FakeAdapter::new(
        FakeAdapterConfig::builder()
            .scan_fixture(TWO_SENSORS.parse().expect("fixture should parse"))
            .permissions_granted(false)
            .build(),
    ));
    let (controller, _events) = start(&fake, SessionConfig::default());

    assert_matches!(
        controller.start_scan(None).await,
        Err(ScanError::PermissionDenied)
    );
    assert!(!fake.is_scanning());

    fake.set_permissions_granted(true);
    controller.start_scan(None).await.expect("scan should start");
    let snapshot = controller.snapshot().await.expect("session is running");
    assert!(snapshot.permissions_granted());
}

#[tokio::test(start_paused = true)]
async fn powered_off_adapter_starts_unavailable() {
    let fake = Arc::new(FakeAdapter::new(
        FakeAdapterConfig::builder()
            .radio_state(RadioState::PoweredOff)
            .build(),
    ));
    let (controller, _events) = start(&fake, SessionConfig::default());

    let snapshot = controller.snapshot().await.expect("session is running");

    assert_eq!(ScanStatus::BluetoothUnavailable, snapshot.scan_status());
}
