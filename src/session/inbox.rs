use time::OffsetDateTime;
use tokio::sync::mpsc;

use super::state::SessionGeneration;
use super::subscriptions::ActiveSubscription;
use crate::error::{AdapterError, ConnectError, SubscriptionError};
use crate::hw::{Peripheral, PeripheralHandle, RadioState, SubscriptionHandle};

/// Sender handed to adapter callbacks and timers so they report back to the session task.
pub(crate) type Loopback = mpsc::UnboundedSender<Inbound>;

/// A link that is up and already watched for drops.
#[derive(Debug)]
pub(crate) struct EstablishedLink {
    pub(crate) link: PeripheralHandle,
    pub(crate) disconnect_monitor: Option<SubscriptionHandle>,
}

#[derive(Debug)]
pub(crate) enum AttachOutcome {
    Attached(Vec<ActiveSubscription>),
    /// Services could not be listed although the link is still up.
    Unavailable(SubscriptionError),
    /// Services could not be listed because the link is gone.
    LinkLost(SubscriptionError),
}

/// Everything that reaches the session task from outside a command.
#[derive(Debug)]
pub(crate) enum Inbound {
    RadioStateChanged(RadioState),
    DeviceFound {
        scan: u64,
        peripheral: Peripheral,
    },
    ScanWindowElapsed {
        scan: u64,
    },
    LinkSettled {
        generation: SessionGeneration,
        outcome: Result<EstablishedLink, ConnectError>,
    },
    SubscriptionsAttached {
        generation: SessionGeneration,
        outcome: AttachOutcome,
    },
    PeripheralDisconnected {
        generation: SessionGeneration,
        cause: Option<AdapterError>,
    },
    ValueReceived {
        generation: SessionGeneration,
        service_uuid: String,
        characteristic_uuid: String,
        value: Vec<u8>,
        received_at: OffsetDateTime,
    },
    ReconnectDue {
        generation: SessionGeneration,
    },
}
