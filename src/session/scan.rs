use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use strum_macros::Display;
use tracing::{debug, warn};

use super::inbox::{Inbound, Loopback};
use super::timer::Scheduled;
use crate::error::ScanError;
use crate::hw::{BleAdapter, Peripheral, PeripheralId, ScanFilter, ScanOptions};

/// Lifecycle of the discovery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Idle,
    Scanning,
    /// The scan window elapsed.
    Finished,
    /// Stopped on request or to make way for a connection.
    Stopped,
    BluetoothUnavailable,
}

/// Discovered peripherals keyed by id, in first-seen order.
///
/// A repeated sighting replaces the stored entry in place.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    entries: Vec<Peripheral>,
    positions: HashMap<PeripheralId, usize>,
}

impl DeviceList {
    /// Inserts or refreshes `peripheral`. Returns `true` when the id was new.
    pub fn upsert(&mut self, peripheral: Peripheral) -> bool {
        if let Some(&position) = self.positions.get(peripheral.id()) {
            self.entries[position] = peripheral;
            return false;
        }
        self.positions
            .insert(peripheral.id().clone(), self.entries.len());
        self.entries.push(peripheral);
        true
    }

    #[must_use]
    pub fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.positions
            .get(id)
            .and_then(|&position| self.entries.get(position))
    }

    /// Finds the first peripheral matching an id or name prefix.
    #[must_use]
    pub fn find(&self, selector: &str) -> Option<&Peripheral> {
        self.entries
            .iter()
            .find(|peripheral| peripheral.matches_selector(selector))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peripheral> {
        self.entries.iter()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Peripheral> {
        self.entries.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }
}

/// Owns the scan window and the device list built from its results.
///
/// Results and window expiry arrive through the session inbox tagged with the
/// scan generation that produced them; anything from an older scan is ignored.
#[derive(Debug, Default)]
pub(crate) struct ScanController {
    status: ScanStatus,
    devices: DeviceList,
    generation: u64,
    window: Option<Scheduled<u64>>,
}

impl ScanController {
    pub(crate) fn status(&self) -> ScanStatus {
        self.status
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.status == ScanStatus::Scanning
    }

    pub(crate) fn devices(&self) -> &DeviceList {
        &self.devices
    }

    /// Clears the device list and starts a scan bounded by `duration`.
    ///
    /// The caller stops any running scan and checks readiness first.
    pub(crate) async fn start(
        &mut self,
        adapter: &dyn BleAdapter,
        filter: ScanFilter,
        duration: Duration,
        loopback: &Loopback,
    ) -> Result<(), ScanError> {
        debug_assert!(!self.is_scanning(), "previous scan must be stopped first");
        self.generation += 1;
        let scan = self.generation;

        let results = loopback.clone();
        adapter
            .start_scan(
                filter,
                ScanOptions::new(false),
                Box::new(move |peripheral: Peripheral| {
                    let _ = results.send(Inbound::DeviceFound { scan, peripheral });
                }),
            )
            .await?;

        let expiry = loopback.clone();
        self.window = Some(Scheduled::after(duration, scan, move || {
            let _ = expiry.send(Inbound::ScanWindowElapsed { scan });
        }));
        self.devices.clear();
        self.status = ScanStatus::Scanning;
        Ok(())
    }

    /// Stops a running scan, leaving `outcome` as the status. Returns `false` when idle.
    pub(crate) async fn stop(&mut self, adapter: &dyn BleAdapter, outcome: ScanStatus) -> bool {
        if !self.is_scanning() {
            return false;
        }
        if let Some(window) = self.window.take() {
            window.cancel();
        }
        // Results already queued from this scan must not land after the stop.
        self.generation += 1;
        if let Err(error) = adapter.stop_scan().await {
            warn!(%error, "adapter failed to stop scanning");
        }
        self.status = outcome;
        true
    }

    /// Records a scan result. Returns `true` when the device list changed.
    pub(crate) fn record(&mut self, scan: u64, peripheral: Peripheral) -> bool {
        if scan != self.generation || !self.is_scanning() {
            debug!(peripheral_id = %peripheral.id(), "dropping result of a finished scan");
            return false;
        }
        self.devices.upsert(peripheral);
        true
    }

    /// Returns whether the window that elapsed belongs to the running scan.
    pub(crate) fn window_elapsed(&self, scan: u64) -> bool {
        let current = self
            .window
            .as_ref()
            .is_some_and(|window| window.generation() == scan);
        current && self.is_scanning()
    }

    /// Marks the scan unavailable while the radio is down. Returns `true` on change.
    pub(crate) fn mark_unavailable(&mut self) -> bool {
        if self.status == ScanStatus::BluetoothUnavailable {
            return false;
        }
        self.status = ScanStatus::BluetoothUnavailable;
        true
    }

    /// Returns to idle once the radio is back. Returns `true` on change.
    pub(crate) fn mark_available(&mut self) -> bool {
        if self.status != ScanStatus::BluetoothUnavailable {
            return false;
        }
        self.status = ScanStatus::Idle;
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::hw::{FakeAdapter, FakeAdapterConfig};

    fn peripheral(id: &str, rssi: i16) -> Peripheral {
        Peripheral::builder().id(id).name("Sensor").rssi(rssi).build()
    }

    #[test]
    fn upsert_keeps_first_seen_order_and_refreshes_in_place() {
        let mut devices = DeviceList::default();

        assert!(devices.upsert(peripheral("AA", -70)));
        assert!(devices.upsert(peripheral("BB", -60)));
        assert!(!devices.upsert(peripheral("AA", -40)));

        let ids: Vec<&str> = devices.iter().map(|device| device.id().as_str()).collect();
        assert_eq!(vec!["AA", "BB"], ids);
        assert_eq!(
            Some(-40),
            devices.get(&PeripheralId::from("AA")).and_then(Peripheral::rssi)
        );
    }

    #[test]
    fn find_matches_id_or_name_prefix() {
        let mut devices = DeviceList::default();
        devices.upsert(Peripheral::builder().id("AA:01").name("Heart Strap").build());

        assert!(devices.find("aa:01").is_some());
        assert!(devices.find("Heart").is_some());
        assert!(devices.find("watch").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn results_after_stop_are_dropped() -> anyhow::Result<()> {
        let adapter = FakeAdapter::new(FakeAdapterConfig::builder().build());
        let (loopback, mut inbox) = mpsc::unbounded_channel();
        let mut scan = ScanController::default();

        scan.start(&adapter, ScanFilter::default(), Duration::from_secs(20), &loopback)
            .await?;
        adapter.emit_discovery(peripheral("AA", -50));
        let Some(Inbound::DeviceFound {
            scan: generation,
            peripheral,
        }) = inbox.recv().await
        else {
            anyhow::bail!("expected a scan result");
        };
        assert!(scan.stop(&adapter, ScanStatus::Stopped).await);

        assert!(!scan.record(generation, peripheral));
        assert!(scan.devices().is_empty());
        assert_eq!(ScanStatus::Stopped, scan.status());
        assert!(!adapter.is_scanning());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_is_reported_for_the_running_scan() -> anyhow::Result<()> {
        let adapter = FakeAdapter::new(FakeAdapterConfig::builder().build());
        let (loopback, mut inbox) = mpsc::unbounded_channel();
        let mut scan = ScanController::default();

        scan.start(&adapter, ScanFilter::default(), Duration::from_secs(3), &loopback)
            .await?;
        let Some(Inbound::ScanWindowElapsed { scan: generation }) = inbox.recv().await else {
            anyhow::bail!("expected the scan window to elapse");
        };

        assert!(scan.window_elapsed(generation));
        assert!(!scan.window_elapsed(generation + 1));
        Ok(())
    }

    #[test]
    fn availability_toggles_only_on_change() {
        let mut scan = ScanController::default();

        assert!(!scan.mark_available());
        assert!(scan.mark_unavailable());
        assert!(!scan.mark_unavailable());
        assert!(scan.mark_available());
        assert_eq!(ScanStatus::Idle, scan.status());
    }
}
