//! Discover Bluetooth Low Energy peripherals, hold a session with one of them,
//! and collect the values its characteristics notify.

mod app;
mod cli;
mod error;
mod hw;
mod notification;
mod session;
mod telemetry;
mod terminal;
mod utils;

pub use app::{
    fake_backend, real_backend, run, run_with_clients, run_with_clients_and_log_level,
    run_with_log_level,
};
pub use cli::{Args, Command, FakeArgs, ListenArgs, LogLevel, OutputFormat, ScanArgs};
pub use error::{
    AdapterError, ConfigError, ConnectError, FixtureError, ScanError, SubscriptionError,
};
pub use hw::{
    AdapterBackend, BleAdapter, CharacteristicInfo, ConnectOptions, DisconnectListener,
    FakeAdapter, FakeAdapterConfig, FakeConnectBehaviour, FakeService, NotificationPayloads,
    Peripheral, PeripheralHandle, PeripheralId, RadioState, ScanFilter, ScanFixture,
    ScanListener, ScanOptions, ServiceInfo, SubscriptionHandle, ValueListener, uuid16,
};
pub use notification::{DEFAULT_LOG_CAPACITY, NotificationEvent, NotificationLog};
pub use session::{
    ActiveSubscription, AdapterStateMonitor, ConnectionState, ConnectionStatus, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_RECONNECT_DELAY, DEFAULT_REQUESTED_MTU, DEFAULT_SCAN_DURATION, DeviceList,
    EventDispatcher, ScanStatus, SessionConfig, SessionController, SessionEvent,
    SessionGeneration, SessionSnapshot, StateSubscription, SubscriptionManager,
    next_connection_status, next_matching, release_all, subscribe_all,
};
pub use terminal::{SystemTerminalClient, TerminalClient};
