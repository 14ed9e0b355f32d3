use std::collections::BTreeSet;
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Power/availability state of the local radio.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Eq,
    PartialEq,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum RadioState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    /// Returns whether scanning and connecting are possible in this state.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

/// Stable, backend-specific peripheral identity.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeripheralId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A peripheral as seen in one advertisement.
#[derive(Debug, Clone, Eq, PartialEq, Builder, Serialize, Deserialize)]
pub struct Peripheral {
    #[builder(into)]
    id: PeripheralId,
    #[builder(into)]
    name: Option<String>,
    rssi: Option<i16>,
    #[builder(default = true)]
    connectable: bool,
    #[builder(default)]
    service_uuids: BTreeSet<String>,
}

impl Peripheral {
    #[must_use]
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the signal strength of the advertisement, if reported.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    #[must_use]
    pub fn is_connectable(&self) -> bool {
        self.connectable
    }

    /// Returns the advertised service UUIDs.
    #[must_use]
    pub fn service_uuids(&self) -> &BTreeSet<String> {
        &self.service_uuids
    }

    /// Returns whether the id matches exactly or the name starts with `selector`.
    #[must_use]
    pub fn matches_selector(&self, selector: &str) -> bool {
        if self.id.as_str().eq_ignore_ascii_case(selector) {
            return true;
        }
        self.name
            .as_deref()
            .is_some_and(|name| name.starts_with(selector))
    }
}

/// A connected link to a peripheral, as issued by the adapter.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PeripheralHandle {
    id: PeripheralId,
    mtu: Option<u16>,
}

impl PeripheralHandle {
    #[must_use]
    pub fn new(id: PeripheralId, mtu: Option<u16>) -> Self {
        Self { id, mtu }
    }

    #[must_use]
    pub fn id(&self) -> &PeripheralId {
        &self.id
    }

    /// Returns the negotiated MTU when the backend reports one.
    #[must_use]
    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }
}

/// Opaque handle for an active characteristic or disconnect monitor.
///
/// Handles are neither `Clone` nor `Copy`: releasing one consumes it.
#[derive(Debug, Eq, PartialEq, Hash, derive_more::Display)]
#[display("subscription#{_0}")]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Options passed to the adapter for a connection request.
#[derive(Debug, Clone, Builder)]
pub struct ConnectOptions {
    mtu: u16,
    timeout: Duration,
    #[builder(default)]
    auto_connect: bool,
}

impl ConnectOptions {
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn auto_connect(&self) -> bool {
        self.auto_connect
    }
}

/// Restricts discovery to peripherals advertising any of the listed services.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    service_uuids: Vec<String>,
}

impl ScanFilter {
    #[must_use]
    pub fn new(service_uuids: Vec<String>) -> Self {
        Self { service_uuids }
    }

    #[must_use]
    pub fn service_uuids(&self) -> &[String] {
        &self.service_uuids
    }
}

/// Discovery options forwarded to the adapter.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct ScanOptions {
    allow_duplicates: bool,
}

impl ScanOptions {
    #[must_use]
    pub fn new(allow_duplicates: bool) -> Self {
        Self { allow_duplicates }
    }

    #[must_use]
    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }
}

/// One GATT service exposed by a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceInfo {
    uuid: String,
    primary: bool,
}

impl ServiceInfo {
    #[must_use]
    pub fn new(uuid: String, primary: bool) -> Self {
        Self { uuid, primary }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }
}

/// One characteristic within a service, with lowercase property labels.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    service_uuid: String,
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    #[must_use]
    pub fn new(service_uuid: String, uuid: String, properties: Vec<String>) -> Self {
        Self {
            service_uuid,
            uuid,
            properties,
        }
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Returns whether the characteristic can push value updates.
    #[must_use]
    pub fn is_notifiable(&self) -> bool {
        self.has_property("notify") || self.has_property("indicate")
    }

    fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::notify(&["read", "notify"], true)]
    #[case::indicate(&["indicate"], true)]
    #[case::upper_case(&["NOTIFY"], true)]
    #[case::read_only(&["read"], false)]
    #[case::none(&[], false)]
    fn notifiable_characteristics_are_detected(#[case] properties: &[&str], #[case] expected: bool) {
        let characteristic = CharacteristicInfo::new(
            "0000180d-0000-1000-8000-00805f9b34fb".into(),
            "00002a37-0000-1000-8000-00805f9b34fb".into(),
            properties.iter().map(ToString::to_string).collect(),
        );
        assert_eq!(expected, characteristic.is_notifiable());
    }

    #[rstest]
    #[case::exact_id("AA:BB:CC", true)]
    #[case::id_case_insensitive("aa:bb:cc", true)]
    #[case::name_prefix("HRM", true)]
    #[case::unrelated("Speaker", false)]
    fn selector_matches_id_or_name_prefix(#[case] selector: &str, #[case] expected: bool) {
        let peripheral = Peripheral::builder()
            .id("AA:BB:CC")
            .name("HRM-Strap")
            .rssi(-40)
            .build();
        assert_eq!(expected, peripheral.matches_selector(selector));
    }

    #[test]
    fn radio_state_round_trips_through_kebab_case() {
        let parsed: RadioState = "powered-off".parse().expect("state should parse");
        assert_eq!(RadioState::PoweredOff, parsed);
        assert_eq!("powered-on", RadioState::PoweredOn.to_string());
    }

    #[test]
    fn subscription_handle_displays_its_id() {
        assert_eq!("subscription#7", SubscriptionHandle::new(7).to_string());
    }
}
