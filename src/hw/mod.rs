mod adapter;
mod btleplug_backend;
mod fake_backend;
mod hardware;
mod model;

pub use self::adapter::{BleAdapter, DisconnectListener, ScanListener, ValueListener};
pub use self::hardware::AdapterBackend;
pub use self::fake_backend::{
    FakeAdapter, FakeAdapterConfig, FakeConnectBehaviour, FakeService, NotificationPayloads,
    ScanFixture, uuid16,
};
pub use self::model::{
    CharacteristicInfo, ConnectOptions, Peripheral, PeripheralHandle, PeripheralId, RadioState,
    ScanFilter, ScanOptions, ServiceInfo, SubscriptionHandle,
};
