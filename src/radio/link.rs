//! Connection state machine, config handshake and outbound actions.
//!
//! One [`RadioLink`] task owns the transport, the session and the MQTT
//! bridge. Adapter callbacks, host commands, broker traffic and timers are
//! all drained by a single `select!` loop, so no two inbound packets are
//! ever dispatched concurrently. Hosts talk to it through a [`LinkHandle`].
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::config::RuntimePreferences;
use crate::correlator::{build_admin_request, AdminCorrelator, AdminIntent, PendingAdminRequest};
use crate::debounce::{start_store_flusher, DebounceHandle};
use crate::dispatch::{apply_config, apply_module_config, markdown, Dispatcher, Effect};
use crate::errors::{LinkError, TransportError};
use crate::events::LinkEvent;
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;
use crate::mqtt::{self, BridgeOutput, MqttBridge, MqttClient, MqttSettings, SessionEvent};
use crate::notify::{Notification, Notifier, QueueOptions};
use crate::protobuf::proto;
use crate::protobuf::proto::admin_message::PayloadVariant as Admin;
use crate::protobuf::proto::from_radio::PayloadVariant as FRPayload;
use crate::radio::codec;
use crate::radio::session::{ConnectionSession, Device, SessionCounters, BROADCAST_NUM};
use crate::radio::state::{
    classify_disconnect, is_auth_failure, ConnectionState, AUTH_FAILURE_TEXT, CONNECT_ERROR_TEXT,
    CONNECT_TIMEOUT_TEXT, HANDSHAKE_TIMEOUT_TEXT,
};
use crate::radio::transport::{AdapterState, PeripheralId, Transport, TransportEvent};
use crate::radio::uuids::{self, CharacteristicRole};
use crate::store::{ChannelRecord, MessageRecord, SharedStore, Store, TraceRouteRecord};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);
/// A connected node's own position is attached to a trace route only when this fresh.
const TRACE_POSITION_MAX_AGE_HOURS: i64 = 24;

/// Admin operations addressed to the connected node.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCall {
    RequestConfig(proto::admin_message::ConfigType),
    RequestModuleConfig(proto::admin_message::ModuleConfigType),
    RequestChannel(i32),
    RequestDeviceMetadata,
    RequestCannedMessages,
    RequestRingtone,
    SaveConfig(proto::Config),
    SaveModuleConfig(proto::ModuleConfig),
    SaveChannel(proto::Channel),
    SaveOwner(proto::User),
    Reboot(i32),
}

/// Outbound text message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingText {
    pub text: String,
    /// Direct recipient; `None` broadcasts on `channel`.
    pub to: Option<u32>,
    pub channel: i32,
    pub is_emoji: bool,
    pub reply_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub device: Option<Device>,
    pub nonce: u32,
    pub is_subscribed: bool,
    pub is_invalid_firmware: bool,
    pub last_error: Option<String>,
    pub pending_admin: usize,
    pub mqtt_open: bool,
    pub discovered: usize,
}

type Reply<T> = oneshot::Sender<Result<T, LinkError>>;

pub enum LinkCommand {
    StartScan,
    Connect(PeripheralId),
    Disconnect { reconnect: bool },
    CancelConnection,
    SetPhonePosition(proto::Position),
    SetDisplayedChannel(Option<i32>),
    SendMessage(OutgoingText, Reply<u32>),
    SendPosition {
        channel: u32,
        dest: Option<u32>,
        want_response: bool,
        reply: Reply<u32>,
    },
    SendTraceRoute(u32, Reply<u32>),
    Admin(AdminCall, Reply<u32>),
    Status(oneshot::Sender<LinkStatus>),
    FlushStore(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable front for a running [`RadioLink`].
#[derive(Clone, Debug)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    fn send(&self, cmd: LinkCommand) -> Result<(), LinkError> {
        self.tx.send(cmd).map_err(|_| LinkError::Closed)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> LinkCommand) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| LinkError::Closed)?
    }

    pub fn start_scan(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::StartScan)
    }

    pub fn connect(&self, peripheral: impl Into<PeripheralId>) -> Result<(), LinkError> {
        self.send(LinkCommand::Connect(peripheral.into()))
    }

    pub fn disconnect(&self, reconnect: bool) -> Result<(), LinkError> {
        self.send(LinkCommand::Disconnect { reconnect })
    }

    pub fn cancel_connection(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::CancelConnection)
    }

    /// Latest phone fix, used by `send_position` and the location timer.
    pub fn set_phone_position(&self, position: proto::Position) -> Result<(), LinkError> {
        self.send(LinkCommand::SetPhonePosition(position))
    }

    pub fn set_displayed_channel(&self, channel: Option<i32>) -> Result<(), LinkError> {
        self.send(LinkCommand::SetDisplayedChannel(channel))
    }

    /// Returns the packet id of the queued message.
    pub async fn send_message(&self, message: OutgoingText) -> Result<u32, LinkError> {
        self.call(|reply| LinkCommand::SendMessage(message, reply)).await
    }

    pub async fn send_position(
        &self,
        channel: u32,
        dest: Option<u32>,
        want_response: bool,
    ) -> Result<u32, LinkError> {
        self.call(|reply| LinkCommand::SendPosition {
            channel,
            dest,
            want_response,
            reply,
        })
        .await
    }

    pub async fn send_trace_route(&self, dest: u32) -> Result<u32, LinkError> {
        self.call(|reply| LinkCommand::SendTraceRoute(dest, reply)).await
    }

    /// Returns the request id the response will be correlated by.
    pub async fn admin(&self, call: AdminCall) -> Result<u32, LinkError> {
        self.call(|reply| LinkCommand::Admin(call, reply)).await
    }

    pub async fn request_config(&self, t: proto::admin_message::ConfigType) -> Result<u32, LinkError> {
        self.admin(AdminCall::RequestConfig(t)).await
    }

    pub async fn request_module_config(
        &self,
        t: proto::admin_message::ModuleConfigType,
    ) -> Result<u32, LinkError> {
        self.admin(AdminCall::RequestModuleConfig(t)).await
    }

    pub async fn request_channel(&self, index: i32) -> Result<u32, LinkError> {
        self.admin(AdminCall::RequestChannel(index)).await
    }

    pub async fn request_device_metadata(&self) -> Result<u32, LinkError> {
        self.admin(AdminCall::RequestDeviceMetadata).await
    }

    pub async fn request_canned_messages(&self) -> Result<u32, LinkError> {
        self.admin(AdminCall::RequestCannedMessages).await
    }

    pub async fn request_ringtone(&self) -> Result<u32, LinkError> {
        self.admin(AdminCall::RequestRingtone).await
    }

    pub async fn save_config(&self, config: proto::Config) -> Result<u32, LinkError> {
        self.admin(AdminCall::SaveConfig(config)).await
    }

    pub async fn save_module_config(&self, config: proto::ModuleConfig) -> Result<u32, LinkError> {
        self.admin(AdminCall::SaveModuleConfig(config)).await
    }

    pub async fn save_channel(&self, channel: proto::Channel) -> Result<u32, LinkError> {
        self.admin(AdminCall::SaveChannel(channel)).await
    }

    pub async fn save_owner(&self, user: proto::User) -> Result<u32, LinkError> {
        self.admin(AdminCall::SaveOwner(user)).await
    }

    pub async fn reboot(&self, seconds: i32) -> Result<u32, LinkError> {
        self.admin(AdminCall::Reboot(seconds)).await
    }

    pub async fn status(&self) -> Result<LinkStatus, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(LinkCommand::Status(tx))?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    /// Force the pending store flush to run now.
    pub async fn flush(&self) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.send(LinkCommand::FlushStore(tx))?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(LinkCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// A connect request waiting for `Connected`.
#[derive(Debug)]
struct PendingConnect {
    peripheral: PeripheralId,
    attempts: u32,
    next_check: Instant,
}

pub struct RadioLink<T: Transport, S: Store, C: MqttClient> {
    transport: T,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    dispatcher: Dispatcher<S>,
    flusher: DebounceHandle<()>,
    notifier: Arc<dyn Notifier>,
    bridge: MqttBridge<C>,
    mqtt_rx: mpsc::UnboundedReceiver<SessionEvent>,
    prefs: RuntimePreferences,
    counters: SessionCounters,
    correlator: AdminCorrelator,
    state: ConnectionState,
    adapter: AdapterState,
    devices: Vec<Device>,
    session: Option<ConnectionSession>,
    connecting: Option<PendingConnect>,
    allow_reconnect: bool,
    last_error: Option<String>,
    phone_position: Option<proto::Position>,
    next_location: Option<Instant>,
}

impl<T, S, C> RadioLink<T, S, C>
where
    T: Transport + 'static,
    S: Store,
    C: MqttClient + 'static,
{
    /// Must be called inside a tokio runtime (the store flusher is spawned here).
    pub fn new(
        transport: T,
        transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        store: SharedStore<S>,
        notifier: Arc<dyn Notifier>,
        mqtt_client: C,
        prefs: RuntimePreferences,
    ) -> (Self, LinkHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (mqtt_tx, mqtt_rx) = mpsc::unbounded_channel();
        let flusher = start_store_flusher(prefs.debounce_window, store.clone());
        let dispatcher = Dispatcher::new(
            store,
            notifier.clone(),
            events.clone(),
            flusher.clone(),
            prefs.clone(),
        );
        let link = Self {
            transport,
            transport_rx,
            commands,
            events,
            dispatcher,
            flusher,
            notifier,
            bridge: MqttBridge::new(mqtt_client, mqtt_tx),
            mqtt_rx,
            correlator: AdminCorrelator::new(prefs.admin_pending_ttl),
            prefs,
            counters: SessionCounters::default(),
            state: ConnectionState::Idle,
            adapter: AdapterState::Unknown,
            devices: Vec::new(),
            session: None,
            connecting: None,
            allow_reconnect: true,
            last_error: None,
            phone_position: None,
            next_location: None,
        };
        (link, LinkHandle { tx: cmd_tx }, events_rx)
    }

    /// Continue the want-config nonce sequence from a previous link.
    pub fn with_counters(mut self, counters: SessionCounters) -> Self {
        self.counters = counters;
        self
    }

    pub async fn run(mut self) {
        let mut next_housekeeping = Instant::now() + HOUSEKEEPING_INTERVAL;
        loop {
            let connect_deadline = self.connecting.as_ref().map(|c| c.next_check);
            let handshake_deadline = self.handshake_deadline();
            let location_deadline = self.next_location;
            tokio::select! {
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event),
                cmd = self.commands.recv() => match cmd {
                    Some(LinkCommand::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(LinkCommand::FlushStore(ack)) => {
                        self.flusher.flush_now().await;
                        let _ = ack.send(());
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.mqtt_rx.recv() => self.on_mqtt_event(event),
                _ = sleep_until_opt(connect_deadline), if connect_deadline.is_some() => {
                    self.on_connect_tick();
                }
                _ = sleep_until_opt(handshake_deadline), if handshake_deadline.is_some() => {
                    self.on_handshake_timeout();
                }
                _ = sleep_until_opt(location_deadline), if location_deadline.is_some() => {
                    self.on_location_tick();
                }
                _ = sleep_until(next_housekeeping) => {
                    next_housekeeping = Instant::now() + HOUSEKEEPING_INTERVAL;
                    self.expire_admin_requests(Instant::now());
                }
            }
        }
        info!("radio link stopped");
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            self.transport.disconnect(session.peripheral_id());
        }
        self.bridge.close();
        self.flusher.shutdown().await;
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("link state: {} -> {}", self.state, state);
            self.state = state.clone();
            self.emit(LinkEvent::StateChanged(state));
        }
    }

    fn set_error(&mut self, message: &str) {
        self.last_error = Some(message.to_string());
        if let Some(s) = self.session.as_mut() {
            s.last_connection_error = Some(message.to_string());
        }
        self.emit(LinkEvent::ConnectionError(message.to_string()));
    }

    fn handshake_deadline(&self) -> Option<Instant> {
        let session = self.session.as_ref()?;
        if session.is_subscribed {
            return None;
        }
        session
            .handshake_started
            .map(|t| t + self.prefs.handshake_timeout)
    }

    /// Events for a peripheral we are neither connected nor connecting to are stale.
    fn is_current(&self, peripheral: &str) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.peripheral_id() == peripheral)
            || self
                .connecting
                .as_ref()
                .map_or(false, |c| c.peripheral == peripheral)
    }

    // ----- transport events -------------------------------------------------

    fn on_transport_event(&mut self, event: TransportEvent) {
        trace!("transport event: {:?}", event);
        match event {
            TransportEvent::StateChanged(state) => self.on_adapter_state(state),
            TransportEvent::Discovered {
                peripheral,
                name,
                rssi,
            } => self.on_discovered(peripheral, name, rssi),
            TransportEvent::Connected { peripheral } => self.on_connected(peripheral),
            TransportEvent::FailedToConnect { peripheral, error }
            | TransportEvent::Disconnected { peripheral, error } => {
                if self.is_current(&peripheral) {
                    self.on_disconnected(&peripheral, error);
                } else {
                    debug!("ignoring disconnect of stale peripheral {}", peripheral);
                }
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
                error,
            } => self.on_services(&peripheral, &services, error),
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
                error,
            } => self.on_characteristics(&peripheral, service, &characteristics, error),
            TransportEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
                error,
            } => self.on_value(&peripheral, characteristic, value, error),
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        info!("bluetooth adapter state: {:?}", state);
        self.adapter = state;
        match state {
            AdapterState::PoweredOn => {
                if self.session.is_none() {
                    self.start_scan();
                }
            }
            _ => {
                if self.session.is_some() || self.connecting.is_some() {
                    self.teardown(format!("Bluetooth adapter {:?}", state));
                }
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    fn start_scan(&mut self) {
        if self.adapter != AdapterState::PoweredOn {
            debug!("scan requested while adapter is {:?}", self.adapter);
            return;
        }
        if !self.transport.is_scanning() {
            self.transport.scan(uuids::MESHTASTIC_SERVICE);
        }
        if self.session.is_none() && self.connecting.is_none() {
            self.set_state(ConnectionState::Scanning);
        }
    }

    fn on_discovered(&mut self, peripheral: PeripheralId, name: Option<String>, rssi: i32) {
        match self.devices.iter_mut().find(|d| d.id == peripheral) {
            Some(device) => {
                device.rssi = rssi;
                device.last_update = Utc::now();
                if let Some(n) = name.filter(|n| !n.is_empty()) {
                    device.name = n;
                }
            }
            None => {
                debug!("discovered peripheral {} ({:?}, rssi {})", peripheral, name, rssi);
                self.devices.push(Device::new(peripheral, name, rssi));
            }
        }
        self.emit(LinkEvent::DevicesChanged(self.devices.clone()));

        if self.prefs.auto_reconnect
            && self.allow_reconnect
            && self.session.is_none()
            && self.connecting.is_none()
        {
            let target = self
                .prefs
                .preferred_peripherals
                .iter()
                .find(|p| self.devices.iter().any(|d| &d.id == *p))
                .cloned();
            if let Some(target) = target {
                info!("auto-reconnecting to preferred peripheral {}", target);
                self.connect_to(target);
            }
        }
    }

    fn connect_to(&mut self, peripheral: PeripheralId) {
        if let Some(session) = &self.session {
            if session.peripheral_id() == peripheral {
                self.emit(LinkEvent::DeviceConnected(session.device.clone()));
                return;
            }
            let current = session.peripheral_id().to_string();
            info!("switching radio from {} to {}", current, peripheral);
            self.transport.disconnect(&current);
            self.teardown("Switched to another radio".into());
            self.emit(LinkEvent::DeviceDisconnected {
                peripheral: current,
                reason: None,
            });
        }
        if let Some(previous) = self.connecting.take() {
            self.transport.disconnect(&previous.peripheral);
        }
        if self.transport.is_scanning() {
            self.transport.stop_scan();
        }
        self.allow_reconnect = true;
        self.connecting = Some(PendingConnect {
            peripheral: peripheral.clone(),
            attempts: 0,
            next_check: Instant::now() + self.prefs.connect_timeout,
        });
        self.set_state(ConnectionState::Connecting);
        self.transport.connect(&peripheral);
    }

    fn on_connect_tick(&mut self) {
        let limit = self.prefs.connect_timeout_attempts;
        let Some(pending) = self.connecting.as_mut() else {
            return;
        };
        pending.attempts += 1;
        if pending.attempts < limit {
            pending.next_check = Instant::now() + self.prefs.connect_timeout;
            return;
        }
        let peripheral = pending.peripheral.clone();
        warn!("connection to {} timed out after {} checks", peripheral, limit);
        self.connecting = None;
        self.transport.disconnect(&peripheral);
        self.set_error(CONNECT_TIMEOUT_TEXT);
        self.set_state(ConnectionState::Disconnected(CONNECT_TIMEOUT_TEXT.into()));
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        let Some(device) = self.devices.iter().find(|d| d.id == peripheral).cloned() else {
            warn!("connected to unknown peripheral {}", peripheral);
            self.connecting = None;
            self.set_error(CONNECT_ERROR_TEXT);
            self.transport.disconnect(&peripheral);
            return;
        };
        if self
            .connecting
            .as_ref()
            .map_or(false, |c| c.peripheral != peripheral)
        {
            debug!("late connect from {} ignored", peripheral);
            self.transport.disconnect(&peripheral);
            return;
        }
        self.connecting = None;
        self.last_error = None;
        info!("connected to {} ({})", device.name, peripheral);

        self.prefs.preferred_peripherals.retain(|p| p != &peripheral);
        self.prefs.preferred_peripherals.insert(0, peripheral.clone());
        self.emit_preferences();

        self.session = Some(ConnectionSession::new(device.clone()));
        self.emit(LinkEvent::DeviceConnected(device));
        self.set_state(ConnectionState::DiscoveringServices);
        self.transport
            .discover_services(&peripheral, &[uuids::MESHTASTIC_SERVICE]);
    }

    fn emit_preferences(&self) {
        self.emit(LinkEvent::PreferencesChanged {
            peripherals: self.prefs.preferred_peripherals.clone(),
            nodes: self.prefs.preferred_nodes.clone(),
        });
    }

    fn on_disconnected(&mut self, peripheral: &str, error: Option<TransportError>) {
        let name = self
            .session
            .as_ref()
            .map(|s| s.device.name.clone())
            .or_else(|| {
                self.devices
                    .iter()
                    .find(|d| d.id == peripheral)
                    .map(|d| d.name.clone())
            });
        let reason = match &error {
            Some(e) => {
                let class = classify_disconnect(e);
                warn!("radio {} disconnected: {}", peripheral, e);
                if class.notify_if_preferred && self.prefs.is_preferred_peripheral(peripheral) {
                    self.notifier.queue(
                        Notification {
                            id: peripheral.to_string(),
                            title: "Radio Disconnected".into(),
                            subtitle: name,
                            body: class.message.clone(),
                            path: Some("meshlink:///connection".into()),
                        },
                        QueueOptions::default(),
                    );
                }
                self.set_error(&class.message);
                Some(class.message)
            }
            None => {
                info!("radio {} disconnected", peripheral);
                None
            }
        };
        self.teardown(reason.clone().unwrap_or_else(|| "Disconnected".into()));
        self.emit(LinkEvent::DeviceDisconnected {
            peripheral: peripheral.to_string(),
            reason,
        });
        if self.allow_reconnect && self.prefs.auto_reconnect {
            self.start_scan();
        }
    }

    /// Drop the session and everything scoped to it.
    fn teardown(&mut self, reason: String) {
        let had_session = self.session.take().is_some();
        self.connecting = None;
        self.next_location = None;
        self.dispatcher.reset_session_flags();
        if self.bridge.is_open() {
            self.bridge.close();
            self.emit(LinkEvent::MqttDisconnected);
        }
        if had_session {
            debug!("session cleared: {}", reason);
        }
        self.set_state(ConnectionState::Disconnected(reason));
    }

    /// Give up on the current peripheral after a failed discovery step.
    fn fail_connection(&mut self, peripheral: &str, message: &str) {
        warn!("{}: {}", peripheral, message);
        self.set_error(message);
        self.transport.disconnect(peripheral);
        self.teardown(message.to_string());
        self.emit(LinkEvent::DeviceDisconnected {
            peripheral: peripheral.to_string(),
            reason: Some(message.to_string()),
        });
    }

    fn on_services(&mut self, peripheral: &str, services: &[uuid::Uuid], error: Option<TransportError>) {
        if self.session.as_ref().map(|s| s.peripheral_id()) != Some(peripheral) {
            return;
        }
        if let Some(e) = error {
            warn!("service discovery failed: {}", e);
            self.fail_connection(peripheral, CONNECT_ERROR_TEXT);
            return;
        }
        if !services.contains(&uuids::MESHTASTIC_SERVICE) {
            self.fail_connection(peripheral, CONNECT_ERROR_TEXT);
            return;
        }
        self.set_state(ConnectionState::DiscoveringCharacteristics);
        self.transport.discover_characteristics(
            peripheral,
            &uuids::CHARACTERISTICS,
            uuids::MESHTASTIC_SERVICE,
        );
    }

    fn on_characteristics(
        &mut self,
        peripheral: &str,
        service: uuid::Uuid,
        characteristics: &[uuid::Uuid],
        error: Option<TransportError>,
    ) {
        if service != uuids::MESHTASTIC_SERVICE {
            return;
        }
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.peripheral_id() == peripheral)
        else {
            return;
        };
        if let Some(e) = error {
            warn!("characteristic discovery failed: {}", e);
            self.fail_connection(peripheral, CONNECT_ERROR_TEXT);
            return;
        }
        for uuid in characteristics {
            let Some(role) = CharacteristicRole::from_uuid(uuid) else {
                continue;
            };
            session.bind(role);
            match role {
                CharacteristicRole::FromNum
                | CharacteristicRole::LogRadio
                | CharacteristicRole::LogRadioLegacy => {
                    self.transport.set_notify(peripheral, *uuid, true);
                }
                CharacteristicRole::ToRadio | CharacteristicRole::FromRadio => {}
            }
        }
        if !session.is_bound(CharacteristicRole::ToRadio)
            || !session.is_bound(CharacteristicRole::FromRadio)
        {
            self.fail_connection(peripheral, CONNECT_ERROR_TEXT);
            return;
        }
        if self.bridge.is_open() {
            info!("new radio link, closing MQTT proxy");
            self.bridge.close();
            self.emit(LinkEvent::MqttDisconnected);
        }
        self.begin_handshake();
    }

    fn begin_handshake(&mut self) {
        let nonce = self.counters.next_nonce();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.nonce = nonce;
        session.is_subscribed = false;
        session.handshake_started = Some(Instant::now());
        session.handshake_attempts += 1;
        let peripheral = session.peripheral_id().to_string();
        info!(
            "requesting config from {} (nonce {}, attempt {})",
            peripheral, nonce, session.handshake_attempts
        );
        self.set_state(ConnectionState::HandshakePending);
        let frame = match codec::want_config(nonce) {
            Ok(f) => f,
            Err(e) => {
                error!("failed to encode want_config: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .write_value(&peripheral, uuids::TO_RADIO, frame, true)
        {
            warn!("want_config write failed: {}", e);
        }
        self.transport.read_value(&peripheral, uuids::FROM_RADIO);
    }

    fn on_handshake_timeout(&mut self) {
        let max = self.prefs.handshake_max_attempts;
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.handshake_attempts >= max {
            let peripheral = session.peripheral_id().to_string();
            warn!("config handshake with {} timed out after {} attempts", peripheral, max);
            self.fail_connection(&peripheral, HANDSHAKE_TIMEOUT_TEXT);
            return;
        }
        debug!("config handshake timed out, re-requesting");
        self.begin_handshake();
    }

    fn on_value(
        &mut self,
        peripheral: &str,
        characteristic: uuid::Uuid,
        value: Option<Bytes>,
        error: Option<TransportError>,
    ) {
        if self.session.as_ref().map(|s| s.peripheral_id()) != Some(peripheral) {
            debug!("dropping value from {} without a live session", peripheral);
            metrics::inc_packets_dropped();
            return;
        }
        if let Some(e) = error {
            if is_auth_failure(&e) {
                warn!("pairing failed on {}: {}", peripheral, e);
                self.allow_reconnect = false;
                self.fail_connection(peripheral, AUTH_FAILURE_TEXT);
            } else {
                warn!("characteristic {} error: {}", characteristic, e);
            }
            return;
        }
        let value = value.unwrap_or_default();
        match CharacteristicRole::from_uuid(&characteristic) {
            Some(CharacteristicRole::FromRadio) => {
                if value.is_empty() {
                    return;
                }
                match codec::decode_from_radio(&value) {
                    Ok(packet) => self.dispatch(packet),
                    Err(e) => debug!(
                        "undecodable from-radio value ({}): {}",
                        e,
                        hex_snippet(&value, 32)
                    ),
                }
                if let Some(s) = &self.session {
                    self.transport.read_value(s.peripheral_id(), uuids::FROM_RADIO);
                }
            }
            Some(CharacteristicRole::FromNum) => {
                self.transport.read_value(peripheral, uuids::FROM_RADIO);
            }
            Some(CharacteristicRole::LogRadio) => {
                match codec::decode_payload::<proto::LogRecord>(&value) {
                    Ok(record) => {
                        info!(target: "radio", "{}", escape_log(&codec::format_log_record(&record)))
                    }
                    Err(e) => debug!("bad log record: {}", e),
                }
            }
            Some(CharacteristicRole::LogRadioLegacy) => {
                let line = String::from_utf8_lossy(&value);
                info!(target: "radio", "{}", escape_log(line.trim_end()));
            }
            Some(CharacteristicRole::ToRadio) | None => {}
        }
    }

    fn dispatch(&mut self, packet: codec::InboundPacket) {
        let Some(session) = self.session.as_mut() else {
            metrics::inc_packets_dropped();
            return;
        };
        let is_my_info = matches!(packet, FRPayload::MyInfo(_));
        let error_before = session.last_connection_error.clone();
        let effects = self.dispatcher.dispatch(session, packet);

        let device = session.device.clone();
        let error_after = session.last_connection_error.clone();
        if let Some(entry) = self.devices.iter_mut().find(|d| d.id == device.id) {
            *entry = device.clone();
        }
        if error_after.is_some() && error_after != error_before {
            if let Some(text) = error_after {
                self.last_error = Some(text.clone());
                self.emit(LinkEvent::ConnectionError(text));
            }
        }
        if is_my_info && device.num != 0 {
            self.prefs.preferred_nodes.retain(|n| *n != device.num);
            self.prefs.preferred_nodes.insert(0, device.num);
            self.emit_preferences();
        }
        for effect in effects {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::PublishMqtt(message) => {
                if !self.bridge.forward_to_broker(&message) {
                    trace!("proxy message for {} not forwarded", escape_log(&message.topic));
                }
            }
            Effect::HandshakeComplete { mqtt } => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.handshake_attempts = 0;
                let firmware = session
                    .firmware_version
                    .clone()
                    .unwrap_or_else(|| crate::radio::firmware::UNKNOWN_VERSION.to_string());
                self.set_state(ConnectionState::Subscribed);
                self.emit(LinkEvent::DevicesChanged(self.devices.clone()));
                match mqtt {
                    Some(cfg) => self.open_bridge(&cfg, &firmware),
                    None => {
                        if self.bridge.is_open() {
                            self.bridge.close();
                            self.emit(LinkEvent::MqttDisconnected);
                        }
                    }
                }
                if self.prefs.provide_location {
                    self.next_location = Some(Instant::now() + self.prefs.location_interval);
                }
            }
            Effect::RequestAnswered(id) => {
                if let Some(pending) = self.correlator.resolve(id) {
                    self.emit(LinkEvent::AdminRequestResolved {
                        request_id: id,
                        intent: pending.intent,
                    });
                }
            }
        }
    }

    fn open_bridge(&mut self, cfg: &proto::module_config::MqttConfig, firmware: &str) {
        let settings = MqttSettings::from_module_config(
            cfg,
            firmware,
            &self.prefs.mqtt_client_id_prefix,
            self.prefs.mqtt_keep_alive,
        );
        if let Err(e) = self.bridge.open(settings) {
            warn!("MQTT proxy failed to start: {}", e);
            self.emit(LinkEvent::MqttError(e.to_string()));
        }
    }

    fn on_mqtt_event(&mut self, event: SessionEvent) {
        match self.bridge.on_event(event) {
            BridgeOutput::Connected => self.emit(LinkEvent::MqttConnected),
            BridgeOutput::Disconnected => self.emit(LinkEvent::MqttDisconnected),
            BridgeOutput::Error(text) => {
                warn!("MQTT proxy error: {}", text);
                self.emit(LinkEvent::MqttError(text));
            }
            BridgeOutput::ToRadio(frame) => {
                if let Err(e) = self.write_to_radio(frame) {
                    debug!("broker message not delivered to radio: {}", e);
                }
            }
            BridgeOutput::Ignored => {}
        }
    }

    fn expire_admin_requests(&mut self, now: Instant) {
        for pending in self.correlator.expire(now) {
            debug!(
                "admin request {} ({}) expired",
                pending.request_id,
                pending.intent.description()
            );
            self.emit(LinkEvent::AdminRequestExpired {
                request_id: pending.request_id,
                intent: pending.intent,
            });
        }
    }

    fn on_location_tick(&mut self) {
        self.next_location = Some(Instant::now() + self.prefs.location_interval);
        let Some(num) = self
            .session
            .as_ref()
            .filter(|s| s.is_subscribed)
            .map(|s| s.node_num())
        else {
            return;
        };
        match self.send_position(0, Some(num), false) {
            Ok(id) => trace!("location timer sent position {}", id),
            Err(LinkError::NoPosition) => trace!("location timer: no phone position yet"),
            Err(e) => debug!("location timer: {}", e),
        }
    }

    // ----- commands ---------------------------------------------------------

    fn on_command(&mut self, cmd: LinkCommand) {
        match cmd {
            LinkCommand::StartScan => self.start_scan(),
            LinkCommand::Connect(peripheral) => self.connect_to(peripheral),
            LinkCommand::Disconnect { reconnect } => self.disconnect(reconnect),
            LinkCommand::CancelConnection => self.cancel_connection(),
            LinkCommand::SetPhonePosition(position) => self.phone_position = Some(position),
            LinkCommand::SetDisplayedChannel(channel) => {
                self.dispatcher.set_displayed_channel(channel)
            }
            LinkCommand::SendMessage(message, reply) => {
                let _ = reply.send(self.send_message(message));
            }
            LinkCommand::SendPosition {
                channel,
                dest,
                want_response,
                reply,
            } => {
                let _ = reply.send(self.send_position(channel, dest, want_response));
            }
            LinkCommand::SendTraceRoute(dest, reply) => {
                let _ = reply.send(self.send_trace_route(dest));
            }
            LinkCommand::Admin(call, reply) => {
                let _ = reply.send(self.send_admin(call));
            }
            LinkCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            // handled in the run loop
            LinkCommand::FlushStore(ack) | LinkCommand::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn status(&self) -> LinkStatus {
        let session = self.session.as_ref();
        LinkStatus {
            state: self.state.clone(),
            device: session.map(|s| s.device.clone()),
            nonce: session.map_or(0, |s| s.nonce),
            is_subscribed: session.map_or(false, |s| s.is_subscribed),
            is_invalid_firmware: session.map_or(false, |s| s.is_invalid_firmware),
            last_error: session
                .and_then(|s| s.last_connection_error.clone())
                .or_else(|| self.last_error.clone()),
            pending_admin: self.correlator.len(),
            mqtt_open: self.bridge.is_open(),
            discovered: self.devices.len(),
        }
    }

    fn disconnect(&mut self, reconnect: bool) {
        self.allow_reconnect = reconnect;
        let peripheral = self
            .session
            .as_ref()
            .map(|s| s.peripheral_id().to_string())
            .or_else(|| self.connecting.as_ref().map(|c| c.peripheral.clone()));
        let Some(peripheral) = peripheral else {
            return;
        };
        info!("disconnecting from {} (reconnect={})", peripheral, reconnect);
        self.transport.disconnect(&peripheral);
        self.teardown("Disconnected".into());
        self.emit(LinkEvent::DeviceDisconnected {
            peripheral,
            reason: None,
        });
    }

    fn cancel_connection(&mut self) {
        if let Some(pending) = self.connecting.take() {
            info!("cancelling connection to {}", pending.peripheral);
            self.transport.disconnect(&pending.peripheral);
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Peripheral and node number of a session that may send packets.
    fn sender(&self) -> Result<(PeripheralId, u32), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotConnected)?;
        if session.node_num() == 0 {
            return Err(LinkError::NodeUnknown);
        }
        Ok((session.peripheral_id().to_string(), session.node_num()))
    }

    fn write_to_radio(&mut self, frame: Bytes) -> Result<(), LinkError> {
        let session = self.session.as_ref().ok_or(LinkError::NotConnected)?;
        self.transport
            .write_value(session.peripheral_id(), uuids::TO_RADIO, frame, true)?;
        Ok(())
    }

    fn write_packet(&mut self, packet: proto::MeshPacket) -> Result<(), LinkError> {
        let frame = codec::mesh_packet(packet)?;
        self.write_to_radio(frame)
    }

    fn send_message(&mut self, message: OutgoingText) -> Result<u32, LinkError> {
        let (_, my_num) = self.sender()?;
        let text = message
            .text
            .replace(['’', '‘'], "'")
            .replace(['”', '“'], "\"");
        let id = codec::random_packet_id();
        let packet = proto::MeshPacket {
            from: my_num,
            to: message.to.unwrap_or(BROADCAST_NUM),
            channel: message.channel.max(0) as u32,
            id,
            want_ack: true,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::from(text.clone().into_bytes()),
                emoji: u32::from(message.is_emoji),
                reply_id: message.reply_id.unwrap_or(0),
                ..Default::default()
            })),
            ..Default::default()
        };
        self.write_packet(packet)?;
        debug!("sent message {} to {:?}", id, message.to);

        if let Ok(mut db) = self.dispatcher.store().lock() {
            db.upsert_message(MessageRecord {
                message_id: id,
                from_num: my_num,
                to_num: message.to,
                channel: message.channel,
                portnum: proto::PortNum::TextMessageApp as i32,
                markdown: Some(markdown::render(&text)),
                text,
                timestamp: Utc::now(),
                read: true,
                is_emoji: message.is_emoji,
                reply_id: message.reply_id,
                ..Default::default()
            });
        }
        self.dispatcher.touch();
        Ok(id)
    }

    fn send_position(
        &mut self,
        channel: u32,
        dest: Option<u32>,
        want_response: bool,
    ) -> Result<u32, LinkError> {
        let (_, my_num) = self.sender()?;
        let mut position = self.phone_position.clone().ok_or(LinkError::NoPosition)?;
        if position.time == 0 {
            position.time = Utc::now().timestamp().max(0) as u32;
        }
        let id = codec::random_packet_id();
        let packet = proto::MeshPacket {
            from: my_num,
            to: dest.unwrap_or(BROADCAST_NUM),
            channel,
            id,
            priority: proto::mesh_packet::Priority::Background as i32,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::PositionApp as i32,
                payload: codec::encode(&position),
                want_response,
                ..Default::default()
            })),
            ..Default::default()
        };
        self.write_packet(packet)?;
        Ok(id)
    }

    fn send_trace_route(&mut self, dest: u32) -> Result<u32, LinkError> {
        let (_, my_num) = self.sender()?;
        let id = codec::random_packet_id();
        let (channel, node_position) = match self.dispatcher.store().lock() {
            Ok(db) => {
                let cutoff = Utc::now() - ChronoDuration::hours(TRACE_POSITION_MAX_AGE_HOURS);
                (
                    db.node(dest).map_or(0, |n| n.channel),
                    db.latest_position(my_num).filter(|p| p.time >= cutoff),
                )
            }
            Err(_) => (0, None),
        };
        let packet = proto::MeshPacket {
            from: my_num,
            to: dest,
            channel,
            id,
            want_ack: true,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: proto::PortNum::TracerouteApp as i32,
                payload: codec::encode(&proto::RouteDiscovery::default()),
                want_response: true,
                ..Default::default()
            })),
            ..Default::default()
        };
        self.write_packet(packet)?;
        if let Ok(mut db) = self.dispatcher.store().lock() {
            db.upsert_trace_route(TraceRouteRecord {
                request_id: id,
                to_num: dest,
                sent: Some(Utc::now()),
                node_position,
                ..Default::default()
            });
        }
        self.dispatcher.touch();
        info!("trace route {} sent to {}", id, dest);
        Ok(id)
    }

    fn send_admin(&mut self, call: AdminCall) -> Result<u32, LinkError> {
        let (_, my_num) = self.sender()?;
        let (intent, variant) = match &call {
            AdminCall::RequestConfig(t) => (
                AdminIntent::RequestConfig(*t as i32),
                Admin::GetConfigRequest(*t as i32),
            ),
            AdminCall::RequestModuleConfig(t) => (
                AdminIntent::RequestModuleConfig(*t as i32),
                Admin::GetModuleConfigRequest(*t as i32),
            ),
            AdminCall::RequestChannel(index) => (
                AdminIntent::RequestChannel(*index),
                Admin::GetChannelRequest((*index).max(0) as u32 + 1),
            ),
            AdminCall::RequestDeviceMetadata => (
                AdminIntent::RequestDeviceMetadata,
                Admin::GetDeviceMetadataRequest(true),
            ),
            AdminCall::RequestCannedMessages => (
                AdminIntent::RequestCannedMessages,
                Admin::GetCannedMessageModuleMessagesRequest(true),
            ),
            AdminCall::RequestRingtone => {
                (AdminIntent::RequestRingtone, Admin::GetRingtoneRequest(true))
            }
            AdminCall::SaveConfig(config) => {
                let section = apply_config(&mut Default::default(), config)
                    .ok_or(LinkError::EmptyPayload)?;
                (AdminIntent::SaveConfig(section), Admin::SetConfig(config.clone()))
            }
            AdminCall::SaveModuleConfig(config) => {
                let section = apply_module_config(&mut Default::default(), config)
                    .ok_or(LinkError::EmptyPayload)?;
                (
                    AdminIntent::SaveModuleConfig(section),
                    Admin::SetModuleConfig(config.clone()),
                )
            }
            AdminCall::SaveChannel(channel) => (
                AdminIntent::SaveChannel(channel.index),
                Admin::SetChannel(channel.clone()),
            ),
            AdminCall::SaveOwner(user) => (AdminIntent::SaveOwner, Admin::SetOwner(user.clone())),
            AdminCall::Reboot(seconds) => (AdminIntent::Reboot(*seconds), Admin::RebootSeconds(*seconds)),
        };

        let admin_channel = self
            .dispatcher
            .store()
            .lock()
            .ok()
            .and_then(|db| db.my_info(my_num))
            .and_then(|info| info.admin_index)
            .unwrap_or(0);
        let admin = proto::AdminMessage {
            payload_variant: Some(variant),
            ..Default::default()
        };
        let request = build_admin_request(
            intent,
            &admin,
            my_num,
            my_num,
            admin_channel.max(0) as u32,
        );
        let request_id = request.packet.id;
        self.write_packet(request.packet)?;
        info!("admin request {}: {}", request_id, request.intent.description());
        self.correlator.register(PendingAdminRequest {
            request_id,
            intent: request.intent,
            to: my_num,
            sent_at: Instant::now(),
        });
        if let Ok(mut db) = self.dispatcher.store().lock() {
            db.upsert_message(request.record);
            apply_saved_locally(&mut *db, my_num, &call);
        }
        self.dispatcher.touch();

        if let AdminCall::SaveOwner(user) = &call {
            if let Some(session) = self.session.as_mut() {
                session.device.long_name = user.long_name.clone();
                session.device.short_name = user.short_name.clone();
            }
        }
        if let AdminCall::SaveModuleConfig(proto::ModuleConfig {
            payload_variant: Some(proto::module_config::PayloadVariant::Mqtt(cfg)),
        }) = &call
        {
            if mqtt::wants_proxy(cfg) {
                let firmware = self
                    .session
                    .as_ref()
                    .and_then(|s| s.firmware_version.clone())
                    .unwrap_or_else(|| crate::radio::firmware::UNKNOWN_VERSION.to_string());
                self.open_bridge(cfg, &firmware);
            } else if self.bridge.is_open() {
                info!("MQTT proxy disabled by config save");
                self.bridge.close();
                self.emit(LinkEvent::MqttDisconnected);
            }
        }
        Ok(request_id)
    }
}

/// Saves are applied to the local copy as soon as they are written.
fn apply_saved_locally<S: Store>(db: &mut S, my_num: u32, call: &AdminCall) {
    match call {
        AdminCall::SaveConfig(config) => {
            let mut record = db.node_config(my_num).unwrap_or_default();
            if apply_config(&mut record, config).is_some() {
                db.upsert_node_config(my_num, record);
            }
        }
        AdminCall::SaveModuleConfig(config) => {
            let mut record = db.node_config(my_num).unwrap_or_default();
            if apply_module_config(&mut record, config).is_some() {
                db.upsert_node_config(my_num, record);
            }
        }
        AdminCall::SaveChannel(channel) => {
            let (Some(mut info), Some(settings)) = (db.my_info(my_num), channel.settings.as_ref())
            else {
                return;
            };
            let mut record = info
                .channel(channel.index)
                .cloned()
                .unwrap_or_else(|| ChannelRecord {
                    index: channel.index,
                    ..Default::default()
                });
            record.name = settings.name.clone();
            record.psk = settings.psk.to_vec();
            record.role = channel.role;
            record.uplink_enabled = settings.uplink_enabled;
            record.downlink_enabled = settings.downlink_enabled;
            info.upsert_channel(record);
            db.upsert_my_info(info);
        }
        AdminCall::SaveOwner(user) => {
            if let Some(mut node) = db.node(my_num) {
                let mut owner = node.user.take().unwrap_or_default();
                owner.long_name = user.long_name.clone();
                owner.short_name = user.short_name.clone();
                owner.is_licensed = user.is_licensed;
                node.user = Some(owner);
                db.upsert_node(node);
            }
        }
        _ => {}
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Spawn a [`RadioLink`] on the current runtime.
pub fn start_link<T, S, C>(
    transport: T,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    store: SharedStore<S>,
    notifier: Arc<dyn Notifier>,
    mqtt_client: C,
    prefs: RuntimePreferences,
) -> (LinkHandle, mpsc::UnboundedReceiver<LinkEvent>, JoinHandle<()>)
where
    T: Transport + 'static,
    S: Store,
    C: MqttClient + 'static,
{
    let (link, handle, events) = RadioLink::new(transport, transport_rx, store, notifier, mqtt_client, prefs);
    let task = tokio::spawn(link.run());
    (handle, events, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::RecordingMqttClient;
    use crate::notify::CollectingNotifier;
    use crate::radio::transport::{RecordingTransport, TransportCall};
    use crate::store::MeshStore;
    use std::sync::Mutex;

    fn harness() -> (
        RadioLink<RecordingTransport, MeshStore, RecordingMqttClient>,
        RecordingTransport,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        harness_with(CollectingNotifier::new())
    }

    fn harness_with(
        notifier: CollectingNotifier,
    ) -> (
        RadioLink<RecordingTransport, MeshStore, RecordingMqttClient>,
        RecordingTransport,
        mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = RecordingTransport::with_responder(tx);
        let store = Arc::new(Mutex::new(MeshStore::in_memory()));
        let (link, _handle, events) = RadioLink::new(
            transport.clone(),
            rx,
            store,
            Arc::new(notifier),
            RecordingMqttClient::new(),
            RuntimePreferences::default(),
        );
        (link, transport, events)
    }

    /// Feed queued transport events until none remain.
    fn pump(link: &mut RadioLink<RecordingTransport, MeshStore, RecordingMqttClient>) {
        while let Ok(event) = link.transport_rx.try_recv() {
            link.on_transport_event(event);
        }
    }

    #[tokio::test]
    async fn values_without_session_are_dropped() {
        let (mut link, transport, _events) = harness();
        link.on_transport_event(TransportEvent::ValueUpdated {
            peripheral: "ghost".into(),
            characteristic: uuids::FROM_RADIO,
            value: Some(codec::encode_from_radio(FRPayload::ConfigCompleteId(1))),
            error: None,
        });
        assert!(link.session.is_none());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn connect_walks_discovery_into_handshake() {
        let (mut link, transport, _events) = harness();
        link.on_transport_event(TransportEvent::StateChanged(AdapterState::PoweredOn));
        link.on_transport_event(TransportEvent::Discovered {
            peripheral: "p1".into(),
            name: Some("Radio".into()),
            rssi: -60,
        });
        link.connect_to("p1".into());
        pump(&mut link);

        assert_eq!(link.state, ConnectionState::HandshakePending);
        let session = link.session.as_ref().unwrap();
        assert_eq!(session.nonce, 1);
        assert!(session.is_bound(CharacteristicRole::FromNum));
        assert_eq!(
            transport.writes_to(uuids::TO_RADIO),
            vec![codec::want_config(1).unwrap()]
        );
        assert!(transport
            .calls()
            .contains(&TransportCall::SetNotify("p1".into(), uuids::LOG_RADIO, true)));
        assert_eq!(link.prefs.preferred_peripherals.first().map(String::as_str), Some("p1"));
    }

    fn connected_to_p1(notifier: &CollectingNotifier) -> RadioLink<RecordingTransport, MeshStore, RecordingMqttClient> {
        let (mut link, _transport, _events) = harness_with(notifier.clone());
        link.on_transport_event(TransportEvent::StateChanged(AdapterState::PoweredOn));
        link.on_transport_event(TransportEvent::Discovered {
            peripheral: "p1".into(),
            name: Some("Radio".into()),
            rssi: -60,
        });
        link.connect_to("p1".into());
        pump(&mut link);
        assert!(link.session.is_some());
        link
    }

    fn drop_link(link: &mut RadioLink<RecordingTransport, MeshStore, RecordingMqttClient>, code: i64) {
        link.on_transport_event(TransportEvent::Disconnected {
            peripheral: "p1".into(),
            error: Some(TransportError::new(code, "peer went away")),
        });
    }

    #[tokio::test]
    async fn preferred_radio_loss_is_notified() {
        let notifier = CollectingNotifier::new();
        let mut link = connected_to_p1(&notifier);
        drop_link(&mut link, 7);

        assert!(link.session.is_none());
        let queued = notifier.notifications();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, "p1");
        assert_eq!(queued[0].title, "Radio Disconnected");
        assert_eq!(queued[0].subtitle.as_deref(), Some("Radio"));
        assert_eq!(queued[0].path.as_deref(), Some("meshlink:///connection"));
    }

    #[tokio::test]
    async fn other_radio_loss_is_not_notified() {
        let notifier = CollectingNotifier::new();
        let mut link = connected_to_p1(&notifier);
        // the host has since picked another radio as its favourite
        link.prefs.preferred_peripherals.insert(0, "p0".into());
        drop_link(&mut link, 7);
        assert!(link.session.is_none());
        assert!(notifier.notifications().is_empty());
    }

    #[tokio::test]
    async fn timeout_disconnect_is_not_notified() {
        let notifier = CollectingNotifier::new();
        let mut link = connected_to_p1(&notifier);
        drop_link(&mut link, 6);
        assert!(link.session.is_none());
        assert!(notifier.notifications().is_empty());
        assert_eq!(
            link.last_error.as_deref(),
            Some("Connection timed out. Will connect back soon.")
        );
    }

    #[tokio::test]
    async fn auth_failure_blocks_reconnect() {
        let (mut link, _transport, _events) = harness();
        link.on_transport_event(TransportEvent::StateChanged(AdapterState::PoweredOn));
        link.on_transport_event(TransportEvent::Discovered {
            peripheral: "p1".into(),
            name: None,
            rssi: -60,
        });
        link.connect_to("p1".into());
        pump(&mut link);
        link.on_transport_event(TransportEvent::ValueUpdated {
            peripheral: "p1".into(),
            characteristic: uuids::FROM_RADIO,
            value: None,
            error: Some(TransportError::new(5, "Authentication is insufficient")),
        });
        assert!(link.session.is_none());
        assert!(!link.allow_reconnect);
        assert_eq!(link.last_error.as_deref(), Some(AUTH_FAILURE_TEXT));
    }

    #[tokio::test]
    async fn handshake_gives_up_after_max_attempts() {
        let (mut link, transport, _events) = harness();
        link.on_transport_event(TransportEvent::StateChanged(AdapterState::PoweredOn));
        link.on_transport_event(TransportEvent::Discovered {
            peripheral: "p1".into(),
            name: None,
            rssi: -60,
        });
        link.connect_to("p1".into());
        pump(&mut link);
        for _ in 1..link.prefs.handshake_max_attempts {
            link.on_handshake_timeout();
            pump(&mut link);
        }
        assert_eq!(transport.writes_to(uuids::TO_RADIO).len(), 3);
        assert_eq!(link.session.as_ref().unwrap().nonce, 3);
        link.on_handshake_timeout();
        assert!(link.session.is_none());
        assert_eq!(link.last_error.as_deref(), Some(HANDSHAKE_TIMEOUT_TEXT));
    }

    #[tokio::test]
    async fn connect_timeout_cancels_after_attempts() {
        let (mut link, transport, _events) = harness();
        link.adapter = AdapterState::PoweredOn;
        link.devices.push(Device::new("p9".into(), None, -90));
        link.connecting = Some(PendingConnect {
            peripheral: "p9".into(),
            attempts: 0,
            next_check: Instant::now(),
        });
        for _ in 0..link.prefs.connect_timeout_attempts {
            link.on_connect_tick();
        }
        assert!(link.connecting.is_none());
        assert_eq!(link.last_error.as_deref(), Some(CONNECT_TIMEOUT_TEXT));
        assert!(transport
            .calls()
            .contains(&TransportCall::Disconnect("p9".into())));
    }

    #[tokio::test]
    async fn outbound_requires_known_node() {
        let (mut link, _transport, _events) = harness();
        assert!(matches!(
            link.send_message(OutgoingText::default()),
            Err(LinkError::NotConnected)
        ));
        link.session = Some(ConnectionSession::new(Device::new("p1".into(), None, 0)));
        assert!(matches!(
            link.send_admin(AdminCall::RequestRingtone),
            Err(LinkError::NodeUnknown)
        ));
    }
}
