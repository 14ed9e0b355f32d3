//! Scan, connect and notification handling for one peripheral at a time.

mod config;
mod controller;
mod events;
mod inbox;
mod radio;
mod scan;
mod state;
mod subscriptions;
mod timer;

pub use self::config::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_RECONNECT_DELAY, DEFAULT_REQUESTED_MTU,
    DEFAULT_SCAN_DURATION, SessionConfig,
};
pub use self::controller::SessionController;
pub use self::events::{EventDispatcher, SessionEvent, next_connection_status, next_matching};
pub use self::radio::{AdapterStateMonitor, StateSubscription};
pub use self::scan::{DeviceList, ScanStatus};
pub use self::state::{ConnectionState, ConnectionStatus, SessionGeneration, SessionSnapshot};
pub use self::subscriptions::{ActiveSubscription, SubscriptionManager, release_all, subscribe_all};
