use std::fmt::{self, Display, Formatter};

use crate::hw::Peripheral;
use crate::session::ScanStatus;
use crate::utils::short_uuid;

use super::painter::Painter;
use super::table::Table;

/// Renders the peripherals found by one scan window.
pub(crate) struct DeviceTableView<'a> {
    devices: &'a [Peripheral],
    outcome: ScanStatus,
    painter: &'a Painter,
}

impl<'a> DeviceTableView<'a> {
    pub(crate) fn new(devices: &'a [Peripheral], outcome: ScanStatus, painter: &'a Painter) -> Self {
        Self {
            devices,
            outcome,
            painter,
        }
    }
}

impl Display for DeviceTableView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.painter.heading(format!("Scan {}:", self.outcome)),
            self.painter
                .value(format!("{} peripheral(s)", self.devices.len()))
        )?;
        if self.devices.is_empty() {
            return write!(f, "\n{}", self.painter.caution("No peripherals found."));
        }

        let mut table = Table::with_header(["id", "name", "rssi", "services"]);
        for device in self.devices {
            table.push_row(vec![
                self.painter.value(device.id().as_str()),
                device.name().unwrap_or("<unknown>").to_string(),
                self.painter.signal(device.rssi()),
                services_label(device),
            ]);
        }
        write!(f, "\n{table}")
    }
}

fn services_label(device: &Peripheral) -> String {
    if device.service_uuids().is_empty() {
        return "-".to_string();
    }
    device
        .service_uuids()
        .iter()
        .map(|uuid| short_uuid(uuid))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn peripheral(id: &str, name: Option<&str>, rssi: Option<i16>) -> Peripheral {
        Peripheral::builder()
            .id(id)
            .maybe_name(name.map(String::from))
            .maybe_rssi(rssi)
            .service_uuids(["0000180d-0000-1000-8000-00805f9b34fb".to_string()].into())
            .build()
    }

    #[test]
    fn empty_scan_says_so() {
        let painter = Painter::new(false);
        let view = DeviceTableView::new(&[], ScanStatus::Finished, &painter);

        assert_eq!(
            "Scan finished: 0 peripheral(s)\nNo peripherals found.",
            view.to_string()
        );
    }

    #[test]
    fn table_lists_every_device_with_short_services() {
        let painter = Painter::new(false);
        let devices = [
            peripheral("AA:BB", Some("Heart Strap"), Some(-61)),
            peripheral("CC:DD", None, None),
        ];

        let rendered = DeviceTableView::new(&devices, ScanStatus::Stopped, &painter).to_string();

        let first_line = rendered.lines().next().unwrap_or_default();
        assert_eq!("Scan stopped: 2 peripheral(s)", first_line);
        assert!(rendered.contains("Heart Strap"));
        assert!(rendered.contains("-61 dBm"));
        assert!(rendered.contains("<unknown>"));
        assert!(rendered.contains("180d"));
        assert!(!rendered.contains("00805f9b34fb"));
    }
}
