use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use super::config::SessionConfig;
use super::events::{EventDispatcher, SessionEvent};
use super::inbox::{AttachOutcome, EstablishedLink, Inbound, Loopback};
use super::radio::{AdapterStateMonitor, StateSubscription};
use super::scan::{ScanController, ScanStatus};
use super::state::{ConnectionStatus, SessionGeneration, SessionSnapshot};
use super::subscriptions::{SubscriptionManager, release_all, subscribe_all};
use super::timer::Scheduled;
use crate::error::{AdapterError, ConfigError, ConnectError, ScanError, error_chain};
use crate::hw::{
    BleAdapter, CharacteristicInfo, ConnectOptions, Peripheral, PeripheralHandle, PeripheralId,
    RadioState, SubscriptionHandle, ValueListener,
};
use crate::notification::{NotificationEvent, NotificationLog};

const COMMAND_CAPACITY: usize = 32;

/// Handle to a running session task.
///
/// Cloning is cheap; every clone drives the same session. All state lives in
/// the task, which applies commands and adapter callbacks one at a time.
#[derive(Debug, Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    events: EventDispatcher,
}

#[derive(Debug)]
enum ConnectTarget {
    Peripheral(Peripheral),
    Id(PeripheralId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    User,
    Reconnect,
}

#[derive(Debug)]
enum Command {
    StartScan {
        duration: Option<Duration>,
        reply: oneshot::Sender<Result<(), ScanError>>,
    },
    StopScan {
        reply: oneshot::Sender<bool>,
    },
    Connect {
        target: ConnectTarget,
        reply: oneshot::Sender<Result<SessionGeneration, ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetAutoReconnect {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Notifications {
        reply: oneshot::Sender<Vec<NotificationEvent>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl SessionController {
    /// Starts a session task on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when `config` does not validate.
    pub fn spawn(adapter: Arc<dyn BleAdapter>, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (commands, command_inbox) = mpsc::channel(COMMAND_CAPACITY);
        let (loopback, inbound) = mpsc::unbounded_channel();
        let events = EventDispatcher::new(config.event_capacity());
        let actor = SessionActor::new(adapter, config, events.clone(), loopback);
        tokio::spawn(actor.run(command_inbox, inbound));
        Ok(Self { commands, events })
    }

    /// Subscribes to session events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.ok()?;
        response.await.ok()
    }

    /// Starts a discovery scan, replacing one already running.
    ///
    /// The device list is cleared and the scan stops by itself after `duration`,
    /// or the configured default.
    ///
    /// # Errors
    ///
    /// Fails when the radio is not powered on, permissions are missing, or the
    /// adapter rejects the request.
    pub async fn start_scan(&self, duration: Option<Duration>) -> Result<(), ScanError> {
        self.request(|reply| Command::StartScan { duration, reply })
            .await
            .unwrap_or(Err(ScanError::ControllerStopped))
    }

    /// Stops the running scan. Returns `false` when none was running.
    pub async fn stop_scan(&self) -> bool {
        self.request(|reply| Command::StopScan { reply })
            .await
            .unwrap_or(false)
    }

    /// Opens a session with `peripheral`.
    ///
    /// Returns once the attempt is underway; progress is reported through
    /// [`SessionEvent::ConnectionStatusChanged`].
    ///
    /// # Errors
    ///
    /// Fails without changing state when another session is connecting or
    /// connected, or when the adapter is not ready.
    pub async fn connect(&self, peripheral: Peripheral) -> Result<SessionGeneration, ConnectError> {
        let target = ConnectTarget::Peripheral(peripheral);
        self.request(|reply| Command::Connect { target, reply })
            .await
            .unwrap_or(Err(ConnectError::ControllerStopped))
    }

    /// Like [`Self::connect`] for a peripheral in the device list.
    ///
    /// # Errors
    ///
    /// Also fails with [`ConnectError::DeviceNotFound`] when no scan has seen `id`.
    pub async fn connect_by_id(
        &self,
        id: impl Into<PeripheralId>,
    ) -> Result<SessionGeneration, ConnectError> {
        let target = ConnectTarget::Id(id.into());
        self.request(|reply| Command::Connect { target, reply })
            .await
            .unwrap_or(Err(ConnectError::ControllerStopped))
    }

    /// Ends the session: cancels any pending attempt or reconnect, releases
    /// every subscription, drops the link and clears the notification log.
    ///
    /// Safe to call at any time, including repeatedly.
    pub async fn disconnect(&self) {
        self.request(|reply| Command::Disconnect { reply }).await;
    }

    pub async fn set_auto_reconnect(&self, enabled: bool) {
        self.request(|reply| Command::SetAutoReconnect { enabled, reply })
            .await;
    }

    /// Returns `None` once the session task has stopped.
    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Returns the discovered peripherals in first-seen order.
    pub async fn devices(&self) -> Vec<Peripheral> {
        self.snapshot()
            .await
            .map(|snapshot| snapshot.devices)
            .unwrap_or_default()
    }

    /// Returns the retained notifications, most recent first.
    pub async fn notifications(&self) -> Vec<NotificationEvent> {
        self.request(|reply| Command::Notifications { reply })
            .await
            .unwrap_or_default()
    }

    /// Stops scanning, disconnects, and ends the session task.
    pub async fn shutdown(&self) {
        self.request(|reply| Command::Shutdown { reply }).await;
    }
}

#[derive(Debug)]
struct ConnectionSession {
    peripheral: Peripheral,
    generation: SessionGeneration,
    status: ConnectionStatus,
    link: Option<PeripheralHandle>,
    disconnect_monitor: Option<SubscriptionHandle>,
    reconnect_attempts: u32,
    /// The in-flight connect task or the armed reconnect timer.
    pending: Option<Scheduled<SessionGeneration>>,
    /// Set when the link drops after its monitor is armed but before the attempt settles.
    dropped_during_setup: bool,
}

impl ConnectionSession {
    fn new(peripheral: Peripheral, generation: SessionGeneration, reconnect_attempts: u32) -> Self {
        Self {
            peripheral,
            generation,
            status: ConnectionStatus::Connecting,
            link: None,
            disconnect_monitor: None,
            reconnect_attempts,
            pending: None,
            dropped_during_setup: false,
        }
    }

    fn is_current(&self, generation: SessionGeneration) -> bool {
        self.generation == generation
    }
}

enum NotReady {
    Radio(RadioState),
    Permissions,
}

impl From<NotReady> for ScanError {
    fn from(reason: NotReady) -> Self {
        match reason {
            NotReady::Radio(state) => Self::AdapterNotReady { state },
            NotReady::Permissions => Self::PermissionDenied,
        }
    }
}

impl From<NotReady> for ConnectError {
    fn from(reason: NotReady) -> Self {
        match reason {
            NotReady::Radio(state) => Self::AdapterNotReady { state },
            NotReady::Permissions => Self::PermissionDenied,
        }
    }
}

struct SessionActor {
    adapter: Arc<dyn BleAdapter>,
    config: SessionConfig,
    events: EventDispatcher,
    loopback: Loopback,
    _radio_listener: StateSubscription,
    radio_state: RadioState,
    permissions_granted: bool,
    auto_reconnect: bool,
    generation: SessionGeneration,
    scan: ScanController,
    session: Option<ConnectionSession>,
    subscriptions: SubscriptionManager,
    log: NotificationLog,
}

impl SessionActor {
    fn new(
        adapter: Arc<dyn BleAdapter>,
        config: SessionConfig,
        events: EventDispatcher,
        loopback: Loopback,
    ) -> Self {
        let radio = AdapterStateMonitor::new(Arc::clone(&adapter));
        let radio_state = radio.current_state();
        let sender = loopback.clone();
        let radio_listener = radio.on_state_change(move |state| {
            let _ = sender.send(Inbound::RadioStateChanged(state));
        });
        let mut scan = ScanController::default();
        if !radio_state.is_ready() {
            scan.mark_unavailable();
        }

        Self {
            auto_reconnect: config.auto_reconnect(),
            log: NotificationLog::with_capacity(config.log_capacity()),
            adapter,
            config,
            events,
            loopback,
            _radio_listener: radio_listener,
            radio_state,
            permissions_granted: false,
            generation: SessionGeneration::default(),
            scan,
            session: None,
            subscriptions: SubscriptionManager::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        info!(radio_state = %self.radio_state, "session controller started");
        self.refresh_permissions().await;

        loop {
            tokio::select! {
                biased;
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
            }
        }
        info!("session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::StartScan { duration, reply } => {
                let result = self.start_scan(duration).await;
                let _ = reply.send(result);
            }
            Command::StopScan { reply } => {
                let stopped = self.stop_scan(ScanStatus::Stopped).await;
                let _ = reply.send(stopped);
            }
            Command::Connect { target, reply } => {
                let result = self.connect(target, ConnectOrigin::User).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::SetAutoReconnect { enabled, reply } => {
                self.set_auto_reconnect(enabled);
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Notifications { reply } => {
                let _ = reply.send(self.log.snapshot());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::RadioStateChanged(state) => self.apply_radio_state(state).await,
            Inbound::DeviceFound { scan, peripheral } => {
                if self.scan.record(scan, peripheral) {
                    self.emit_device_list();
                }
            }
            Inbound::ScanWindowElapsed { scan } => {
                if self.scan.window_elapsed(scan) {
                    info!("scan window elapsed");
                    self.stop_scan(ScanStatus::Finished).await;
                }
            }
            Inbound::LinkSettled {
                generation,
                outcome,
            } => self.link_settled(generation, outcome).await,
            Inbound::SubscriptionsAttached {
                generation,
                outcome,
            } => self.subscriptions_attached(generation, outcome).await,
            Inbound::PeripheralDisconnected { generation, cause } => {
                self.peripheral_disconnected(generation, cause).await;
            }
            Inbound::ValueReceived {
                generation,
                service_uuid,
                characteristic_uuid,
                value,
                received_at,
            } => self.value_received(
                generation,
                service_uuid,
                characteristic_uuid,
                value,
                received_at,
            ),
            Inbound::ReconnectDue { generation } => self.reconnect_due(generation).await,
        }
    }

    /// Applies one reported radio transition.
    ///
    /// Any state other than powered on ends a running scan, even when a later
    /// transition has already brought the radio back.
    async fn apply_radio_state(&mut self, state: RadioState) {
        let previous = std::mem::replace(&mut self.radio_state, state);
        if previous == state {
            trace!(%state, "radio state reported");
        } else {
            info!(%previous, %state, "radio state changed");
            self.emit_readiness();
        }

        if state.is_ready() {
            if self.scan.mark_available() {
                self.emit_scan_status();
            }
        } else if !self.stop_scan(ScanStatus::BluetoothUnavailable).await
            && self.scan.mark_unavailable()
        {
            self.emit_scan_status();
        }
    }

    async fn refresh_permissions(&mut self) -> bool {
        let granted = match self.adapter.request_permissions().await {
            Ok(granted) => granted,
            Err(error) => {
                warn!(error = %error_chain(&error), "permission request failed");
                false
            }
        };
        if granted != self.permissions_granted {
            self.permissions_granted = granted;
            self.emit_readiness();
        }
        granted
    }

    async fn ensure_ready(&mut self) -> Result<(), NotReady> {
        // Gate on the live state; the cached one catches up through the queued transitions.
        let radio_state = self.adapter.radio_state();
        if !radio_state.is_ready() {
            return Err(NotReady::Radio(radio_state));
        }
        if !self.refresh_permissions().await {
            return Err(NotReady::Permissions);
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn start_scan(&mut self, duration: Option<Duration>) -> Result<(), ScanError> {
        self.ensure_ready().await?;
        self.stop_scan(ScanStatus::Stopped).await;

        let duration = duration.unwrap_or(self.config.scan_duration());
        self.scan
            .start(
                self.adapter.as_ref(),
                self.config.scan_filter().clone(),
                duration,
                &self.loopback,
            )
            .await?;
        info!(duration = %humantime::format_duration(duration), "scan started");
        self.emit_device_list();
        self.emit_scan_status();
        Ok(())
    }

    async fn stop_scan(&mut self, outcome: ScanStatus) -> bool {
        let stopped = self.scan.stop(self.adapter.as_ref(), outcome).await;
        if stopped {
            info!(%outcome, devices = self.scan.devices().len(), "scan stopped");
            self.emit_scan_status();
        }
        stopped
    }

    #[instrument(skip(self, target), level = "debug")]
    async fn connect(
        &mut self,
        target: ConnectTarget,
        origin: ConnectOrigin,
    ) -> Result<SessionGeneration, ConnectError> {
        let peripheral = match target {
            ConnectTarget::Peripheral(peripheral) => peripheral,
            ConnectTarget::Id(id) => self
                .scan
                .devices()
                .get(&id)
                .cloned()
                .ok_or(ConnectError::DeviceNotFound { id })?,
        };
        if let Some(session) = &self.session
            && session.status.is_active()
        {
            return Err(ConnectError::Busy {
                current: session.peripheral.id().clone(),
            });
        }
        self.ensure_ready().await?;
        self.stop_scan(ScanStatus::Stopped).await;

        // Replacing a failed or reconnecting session drops its timer.
        let previous = self.session.take();
        let reconnect_attempts = match (origin, &previous) {
            (ConnectOrigin::Reconnect, Some(previous)) => previous.reconnect_attempts,
            _ => 0,
        };
        drop(previous);

        self.generation = self.generation.next();
        let generation = self.generation;
        let id = peripheral.id().clone();
        let mut session = ConnectionSession::new(peripheral, generation, reconnect_attempts);

        info!(peripheral_id = %id, %generation, ?origin, "connecting");
        session.pending = Some(Scheduled::spawn(
            generation,
            establish_link(
                Arc::clone(&self.adapter),
                id,
                self.config.connect_options(),
                generation,
                self.loopback.clone(),
            ),
        ));
        self.session = Some(session);
        self.emit_status();
        Ok(generation)
    }

    async fn link_settled(
        &mut self,
        generation: SessionGeneration,
        outcome: Result<EstablishedLink, ConnectError>,
    ) {
        let awaiting = self.session.as_ref().is_some_and(|session| {
            session.is_current(generation) && session.status == ConnectionStatus::Connecting
        });
        if !awaiting {
            debug!(%generation, "ignoring the result of a superseded connection attempt");
            if let Ok(established) = outcome {
                self.discard_link(established).await;
            }
            return;
        }

        let dropped = self.session.as_mut().is_some_and(|session| {
            session.pending = None;
            std::mem::take(&mut session.dropped_during_setup)
        });
        match outcome {
            Ok(established) if dropped => {
                if let Some(handle) = established.disconnect_monitor {
                    self.release_monitor(handle).await;
                }
                self.attempt_failed(ConnectError::DeviceDisconnectedDuringSetup);
            }
            Ok(established) => self.link_ready(established),
            Err(error) => self.attempt_failed(error),
        }
    }

    /// Marks the session connected and starts attaching notifications off the session task.
    fn link_ready(&mut self, established: EstablishedLink) {
        let EstablishedLink {
            link,
            disconnect_monitor,
        } = established;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let generation = session.generation;
        session.status = ConnectionStatus::Connected { mtu: link.mtu() };
        session.reconnect_attempts = 0;
        session.link = Some(link.clone());
        session.disconnect_monitor = disconnect_monitor;
        info!(peripheral_id = %link.id(), %generation, mtu = ?link.mtu(), "connected");
        self.emit_status();

        // Left running when the session moves on; its handles are released on arrival.
        tokio::spawn(attach_subscriptions(
            Arc::clone(&self.adapter),
            link,
            generation,
            self.loopback.clone(),
        ));
    }

    async fn subscriptions_attached(&mut self, generation: SessionGeneration, outcome: AttachOutcome) {
        let live = self
            .session
            .as_ref()
            .filter(|session| {
                session.is_current(generation)
                    && matches!(session.status, ConnectionStatus::Connected { .. })
            })
            .map(|session| session.peripheral.id().clone());
        let Some(peripheral_id) = live else {
            if let AttachOutcome::Attached(subscriptions) = outcome {
                debug!(%generation, "releasing subscriptions of a superseded link");
                release_all(self.adapter.as_ref(), subscriptions).await;
            }
            return;
        };

        match outcome {
            AttachOutcome::Attached(subscriptions) => {
                let count = self
                    .subscriptions
                    .adopt(self.adapter.as_ref(), subscriptions)
                    .await;
                self.events.send(SessionEvent::SubscriptionsAttached {
                    peripheral_id,
                    count,
                });
            }
            AttachOutcome::Unavailable(error) => {
                warn!(error = %error_chain(&error), "no notifications will be received");
            }
            AttachOutcome::LinkLost(error) => {
                warn!(
                    %peripheral_id,
                    error = %error_chain(&error),
                    "link dropped before notifications were set up"
                );
                self.release_link_resources().await;
                self.attempt_failed(ConnectError::DeviceDisconnectedDuringSetup);
            }
        }
    }

    fn attempt_failed(&mut self, error: ConnectError) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        warn!(
            peripheral_id = %session.peripheral.id(),
            generation = %session.generation,
            %error,
            "connection attempt failed"
        );
        session.pending = None;
        session.link = None;
        session.status = ConnectionStatus::Failed {
            error: error.clone(),
        };
        self.emit_status();

        if self.auto_reconnect && !error.is_cancellation() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.reconnect_delay();
        let limit = self.config.max_reconnect_attempts();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if limit.is_some_and(|limit| session.reconnect_attempts >= limit) {
            let peripheral_id = session.peripheral.id().clone();
            let attempts = session.reconnect_attempts;
            let lost = session.status == ConnectionStatus::Disconnected;
            warn!(%peripheral_id, attempts, "giving up on reconnecting");
            self.events.send(SessionEvent::ReconnectAbandoned {
                peripheral_id,
                attempts,
            });
            if lost {
                self.session = None;
            }
            return;
        }

        session.reconnect_attempts += 1;
        let attempt = session.reconnect_attempts;
        let generation = session.generation;
        let sender = self.loopback.clone();
        session.pending = Some(Scheduled::after(delay, generation, move || {
            let _ = sender.send(Inbound::ReconnectDue { generation });
        }));
        session.status = ConnectionStatus::Reconnecting { attempt, delay };
        let peripheral_id = session.peripheral.id().clone();
        info!(
            %peripheral_id,
            attempt,
            delay = %humantime::format_duration(delay),
            "reconnect scheduled"
        );
        self.events.send(SessionEvent::ReconnectScheduled {
            peripheral_id,
            attempt,
            delay,
        });
        self.emit_status();
    }

    async fn reconnect_due(&mut self, generation: SessionGeneration) {
        let peripheral = match self.session.as_mut() {
            Some(session)
                if session.is_current(generation)
                    && matches!(session.status, ConnectionStatus::Reconnecting { .. }) =>
            {
                session.pending = None;
                session.peripheral.clone()
            }
            _ => {
                debug!(%generation, "ignoring a stale reconnect timer");
                return;
            }
        };

        if let Err(error) = self
            .connect(ConnectTarget::Peripheral(peripheral), ConnectOrigin::Reconnect)
            .await
        {
            self.attempt_failed(error);
        }
    }

    async fn peripheral_disconnected(
        &mut self,
        generation: SessionGeneration,
        cause: Option<AdapterError>,
    ) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|session| session.is_current(generation))
        else {
            debug!(%generation, "ignoring a disconnect from a superseded link");
            return;
        };
        match session.status {
            ConnectionStatus::Connected { .. } => {}
            ConnectionStatus::Connecting => {
                debug!(%generation, "link dropped before the attempt settled");
                session.dropped_during_setup = true;
                return;
            }
            _ => {
                debug!(%generation, "ignoring a disconnect outside a live link");
                return;
            }
        }

        self.release_link_resources().await;
        let cancelled = matches!(cause, Some(AdapterError::Cancelled));
        if let Some(session) = self.session.as_mut() {
            session.status = ConnectionStatus::Disconnected;
            warn!(
                peripheral_id = %session.peripheral.id(),
                cause = cause.as_ref().map(|error| error_chain(error)),
                "peripheral disconnected"
            );
        }
        self.emit_status();

        if self.auto_reconnect && !cancelled {
            self.schedule_reconnect();
        } else {
            self.session = None;
        }
    }

    async fn release_link_resources(&mut self) {
        self.subscriptions.detach_all(self.adapter.as_ref()).await;
        let monitor = self.session.as_mut().and_then(|session| {
            session.link = None;
            session.disconnect_monitor.take()
        });
        if let Some(handle) = monitor {
            self.release_monitor(handle).await;
        }
    }

    async fn release_monitor(&self, handle: SubscriptionHandle) {
        if let Err(error) = self.adapter.remove_subscription(handle).await {
            warn!(error = %error_chain(&error), "failed to release the disconnect monitor");
        }
    }

    /// Lets go of a link whose attempt was superseded.
    async fn discard_link(&self, established: EstablishedLink) {
        let EstablishedLink {
            link,
            disconnect_monitor,
        } = established;
        if let Some(handle) = disconnect_monitor {
            self.release_monitor(handle).await;
        }
        let in_use = self
            .session
            .as_ref()
            .is_some_and(|session| session.peripheral.id() == link.id());
        if !in_use {
            self.cancel_link(link.id()).await;
        }
    }

    async fn cancel_link(&self, id: &PeripheralId) {
        if let Err(error) = self.adapter.cancel_connection(id).await {
            debug!(peripheral_id = %id, error = %error_chain(&error), "link termination failed");
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&mut self) {
        let mut session = self.session.take();
        if let Some(session) = session.as_mut() {
            self.generation = self.generation.next();
            if let Some(pending) = session.pending.take() {
                pending.cancel();
            }
        }

        self.subscriptions.detach_all(self.adapter.as_ref()).await;
        if let Some(handle) = session
            .as_mut()
            .and_then(|session| session.disconnect_monitor.take())
        {
            self.release_monitor(handle).await;
        }
        if let Some(session) = &session {
            self.cancel_link(session.peripheral.id()).await;
        }

        if !self.log.is_empty() {
            self.log.clear();
            self.events.send(SessionEvent::NotificationLogCleared);
        }

        match session {
            Some(session) => {
                info!(peripheral_id = %session.peripheral.id(), "disconnected");
                self.events.send(SessionEvent::ConnectionStatusChanged {
                    peripheral_id: Some(session.peripheral.id().clone()),
                    generation: self.generation,
                    status: ConnectionStatus::Disconnected,
                });
            }
            None => debug!("disconnect requested without a session"),
        }
    }

    fn value_received(
        &mut self,
        generation: SessionGeneration,
        service_uuid: String,
        characteristic_uuid: String,
        value: Vec<u8>,
        received_at: OffsetDateTime,
    ) {
        let live = self.session.as_ref().is_some_and(|session| {
            session.is_current(generation)
                && matches!(session.status, ConnectionStatus::Connected { .. })
        });
        if !live {
            trace!(%generation, "dropping a value from a released subscription");
            return;
        }
        let event = self.subscriptions.record(
            &mut self.log,
            service_uuid,
            characteristic_uuid,
            value,
            received_at,
        );
        debug!(
            sequence = event.sequence(),
            characteristic = event.characteristic_uuid(),
            "notification received"
        );
        self.events.send(SessionEvent::NotificationReceived { event });
    }

    fn set_auto_reconnect(&mut self, enabled: bool) {
        if self.auto_reconnect != enabled {
            info!(enabled, "auto-reconnect changed");
        }
        self.auto_reconnect = enabled;
    }

    async fn teardown(&mut self) {
        self.stop_scan(ScanStatus::Stopped).await;
        self.disconnect().await;
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            radio_state: self.radio_state,
            permissions_granted: self.permissions_granted,
            scan_status: self.scan.status(),
            devices: self.scan.devices().to_vec(),
            peripheral: session.map(|session| session.peripheral.clone()),
            status: session.map_or(ConnectionStatus::Disconnected, |session| {
                session.status.clone()
            }),
            generation: self.generation,
            reconnect_attempts: session.map_or(0, |session| session.reconnect_attempts),
            auto_reconnect: self.auto_reconnect,
            subscription_count: self.subscriptions.count(),
            notification_count: self.log.len(),
        }
    }

    fn emit_status(&self) {
        let (peripheral_id, status) = match &self.session {
            Some(session) => (
                Some(session.peripheral.id().clone()),
                session.status.clone(),
            ),
            None => (None, ConnectionStatus::Disconnected),
        };
        self.events.send(SessionEvent::ConnectionStatusChanged {
            peripheral_id,
            generation: self.generation,
            status,
        });
    }

    fn emit_scan_status(&self) {
        self.events.send(SessionEvent::ScanStatusChanged {
            status: self.scan.status(),
        });
    }

    fn emit_device_list(&self) {
        self.events.send(SessionEvent::DeviceListUpdated {
            devices: self.scan.devices().to_vec(),
        });
    }

    fn emit_readiness(&self) {
        self.events.send(SessionEvent::ReadinessChanged {
            radio_state: self.radio_state,
            permissions_granted: self.permissions_granted,
        });
    }
}

fn value_forwarder(
    sender: &Loopback,
    generation: SessionGeneration,
    characteristic: &CharacteristicInfo,
) -> ValueListener {
    let sender = sender.clone();
    let service_uuid = characteristic.service_uuid().to_string();
    let characteristic_uuid = characteristic.uuid().to_string();
    Box::new(move |value: Vec<u8>| {
        let _ = sender.send(Inbound::ValueReceived {
            generation,
            service_uuid: service_uuid.clone(),
            characteristic_uuid: characteristic_uuid.clone(),
            value,
            received_at: OffsetDateTime::now_utc(),
        });
    })
}

async fn establish_link(
    adapter: Arc<dyn BleAdapter>,
    id: PeripheralId,
    options: ConnectOptions,
    generation: SessionGeneration,
    loopback: Loopback,
) {
    let opened = match existing_link(adapter.as_ref(), &id).await {
        Some(link) => Ok(link),
        None => open_link(adapter.as_ref(), &id, options).await,
    };
    let outcome = match opened {
        Ok(link) => watch_link(adapter.as_ref(), link, generation, &loopback).await,
        Err(error) => Err(error),
    };
    let _ = loopback.send(Inbound::LinkSettled {
        generation,
        outcome,
    });
}

async fn existing_link(adapter: &dyn BleAdapter, id: &PeripheralId) -> Option<PeripheralHandle> {
    match adapter.connected_peripheral(id).await {
        Ok(Some(link)) => {
            info!(peripheral_id = %id, "peripheral already connected, reusing the link");
            Some(link)
        }
        Ok(None) => None,
        Err(error) => {
            debug!(error = %error_chain(&error), "connection probe failed");
            None
        }
    }
}

/// Arms disconnect monitoring on a fresh link before it is reported as settled.
#[instrument(skip_all, fields(peripheral_id = %link.id()))]
async fn watch_link(
    adapter: &dyn BleAdapter,
    link: PeripheralHandle,
    generation: SessionGeneration,
    loopback: &Loopback,
) -> Result<EstablishedLink, ConnectError> {
    let sender = loopback.clone();
    let disconnect_monitor = match adapter
        .monitor_disconnection(
            &link,
            Box::new(move |cause: Option<AdapterError>| {
                let _ = sender.send(Inbound::PeripheralDisconnected { generation, cause });
            }),
        )
        .await
    {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(
                error = %error_chain(&error),
                "disconnect monitoring unavailable for this link"
            );
            None
        }
    };

    // A drop that happened before the monitor was armed only shows up here.
    match adapter.connected_peripheral(link.id()).await {
        Ok(None) => {
            if let Some(handle) = disconnect_monitor
                && let Err(error) = adapter.remove_subscription(handle).await
            {
                debug!(error = %error_chain(&error), "failed to release the disconnect monitor");
            }
            Err(ConnectError::DeviceDisconnectedDuringSetup)
        }
        Ok(Some(_)) => Ok(EstablishedLink {
            link,
            disconnect_monitor,
        }),
        Err(error) => {
            debug!(error = %error_chain(&error), "link check failed, assuming the link is up");
            Ok(EstablishedLink {
                link,
                disconnect_monitor,
            })
        }
    }
}

async fn attach_subscriptions(
    adapter: Arc<dyn BleAdapter>,
    link: PeripheralHandle,
    generation: SessionGeneration,
    loopback: Loopback,
) {
    let attached = subscribe_all(adapter.as_ref(), &link, |characteristic| {
        value_forwarder(&loopback, generation, characteristic)
    })
    .await;
    let outcome = match attached {
        Ok(subscriptions) => AttachOutcome::Attached(subscriptions),
        Err(error) => match adapter.connected_peripheral(link.id()).await {
            Ok(None) => AttachOutcome::LinkLost(error),
            Ok(Some(_)) | Err(_) => AttachOutcome::Unavailable(error),
        },
    };
    let _ = loopback.send(Inbound::SubscriptionsAttached {
        generation,
        outcome,
    });
}

#[instrument(skip_all, fields(peripheral_id = %id))]
async fn open_link(
    adapter: &dyn BleAdapter,
    id: &PeripheralId,
    options: ConnectOptions,
) -> Result<PeripheralHandle, ConnectError> {
    let limit = options.timeout();
    let link = match timeout(limit, adapter.connect(id, options)).await {
        Ok(Ok(link)) => link,
        Ok(Err(error)) => return Err(ConnectError::from_connect_failure(&error, limit)),
        Err(_elapsed) => {
            if let Err(error) = adapter.cancel_connection(id).await {
                debug!(error = %error_chain(&error), "failed to cancel the timed out attempt");
            }
            return Err(ConnectError::ConnectTimeout { timeout: limit });
        }
    };

    if let Err(error) = adapter.discover_services_and_characteristics(&link).await {
        let classified = ConnectError::from_discovery_failure(&error);
        if let Err(error) = adapter.cancel_connection(id).await {
            debug!(error = %error_chain(&error), "failed to drop the half-open link");
        }
        return Err(classified);
    }
    Ok(link)
}
