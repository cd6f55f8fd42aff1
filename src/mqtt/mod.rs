//! MQTT client proxy bridge.
//!
//! When the radio's MQTT module runs in proxy-to-client mode, it hands
//! `MqttClientProxyMessage`s to the phone to publish, and expects broker
//! traffic for its topic back in the same envelope. [`MqttBridge`] owns that
//! translation and the lifecycle of an [`MqttClient`].
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::MqttError;
use crate::logutil::escape_log;
use crate::metrics;
use crate::protobuf::proto;
use crate::radio::{codec, firmware};

#[cfg(feature = "mqtt-client")]
pub mod rumqtt;

pub const DEFAULT_HOST: &str = "mqtt.meshtastic.org";
pub const DEFAULT_ROOT: &str = "msh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Subscription filter, e.g. `msh/2/e/#`.
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl MqttSettings {
    /// Broker settings for a node's MQTT module config.
    pub fn from_module_config(
        cfg: &proto::module_config::MqttConfig,
        firmware_version: &str,
        client_id_prefix: &str,
        keep_alive: Duration,
    ) -> Self {
        let default_port: u16 = if cfg.tls_enabled { 8883 } else { 1883 };
        let (host, port) = match cfg.address.trim() {
            "" => (DEFAULT_HOST.to_string(), default_port),
            addr => match addr.split_once(':') {
                Some((h, p)) => (h.to_string(), p.parse().unwrap_or(default_port)),
                None => (addr.to_string(), default_port),
            },
        };
        let root = if cfg.root.is_empty() {
            DEFAULT_ROOT
        } else {
            cfg.root.as_str()
        };
        let segment = if firmware::uses_encrypted_mqtt_topic(firmware_version) {
            "/2/e"
        } else {
            "/2/c"
        };
        Self {
            host,
            port,
            tls: cfg.tls_enabled,
            username: Some(cfg.username.clone()).filter(|u| !u.is_empty()),
            password: Some(cfg.password.clone()).filter(|p| !p.is_empty()),
            topic: format!("{}{}/#", root, segment),
            client_id: format!("{}_{}", client_id_prefix, std::process::id()),
            keep_alive,
        }
    }
}

/// Proxying requires both the module and its proxy-to-client switch.
pub fn wants_proxy(cfg: &proto::module_config::MqttConfig) -> bool {
    cfg.enabled && cfg.proxy_to_client_enabled
}

/// Status topics are never bridged in either direction.
pub fn is_stat_topic(topic: &str) -> bool {
    topic.contains("/stat/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    ConnectRefused(String),
    Message {
        topic: String,
        payload: Bytes,
        retained: bool,
    },
    Disconnected(Option<String>),
}

/// An [`MqttEvent`] stamped with the bridge session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: MqttEvent,
}

/// Handed to a client on `connect`. Events it sends carry that connect's
/// session, so traffic from a closed session can be told apart.
#[derive(Debug, Clone)]
pub struct MqttEventSender {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl MqttEventSender {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    /// False once the receiving side is gone.
    pub fn send(&self, event: MqttEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Broker connection. Results of `connect` arrive later as [`MqttEvent`]s.
pub trait MqttClient: Send {
    fn connect(&mut self, settings: &MqttSettings, events: MqttEventSender) -> Result<(), MqttError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), MqttError>;
    fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError>;
    fn disconnect(&mut self);
}

/// What the link should do after a broker event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutput {
    Connected,
    Disconnected,
    Error(String),
    /// Proxy message to write to the to-radio characteristic (with response).
    ToRadio(Bytes),
    Ignored,
}

pub struct MqttBridge<C: MqttClient> {
    client: C,
    events: mpsc::UnboundedSender<SessionEvent>,
    settings: Option<MqttSettings>,
    connected: bool,
    /// Bumped on every open; events from earlier sessions are dropped.
    session: u64,
}

impl<C: MqttClient> MqttBridge<C> {
    pub fn new(client: C, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            client,
            events,
            settings: None,
            connected: false,
            session: 0,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn is_open(&self) -> bool {
        self.settings.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn settings(&self) -> Option<&MqttSettings> {
        self.settings.as_ref()
    }

    /// (Re)open the broker session; an open one is closed first.
    pub fn open(&mut self, settings: MqttSettings) -> Result<(), MqttError> {
        self.close();
        info!(
            "MQTT proxy connecting to {}:{} (tls={}) topic {}",
            settings.host, settings.port, settings.tls, settings.topic
        );
        self.session = self.session.wrapping_add(1);
        self.client
            .connect(&settings, MqttEventSender::new(self.session, self.events.clone()))?;
        self.settings = Some(settings);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.settings.take().is_some() {
            debug!("MQTT proxy closing");
            self.client.disconnect();
        }
        self.connected = false;
    }

    /// Radio -> broker. Returns true when the message was published.
    pub fn forward_to_broker(&mut self, message: &proto::MqttClientProxyMessage) -> bool {
        if !self.is_open() || !self.connected || is_stat_topic(&message.topic) {
            return false;
        }
        let payload = match &message.payload_variant {
            Some(proto::mqtt_client_proxy_message::PayloadVariant::Data(d)) => d.clone(),
            Some(proto::mqtt_client_proxy_message::PayloadVariant::Text(t)) => {
                Bytes::from(t.clone().into_bytes())
            }
            None => Bytes::new(),
        };
        match self.client.publish(&message.topic, payload, message.retained) {
            Ok(()) => {
                metrics::inc_mqtt_up();
                true
            }
            Err(e) => {
                warn!("MQTT publish to {} failed: {}", escape_log(&message.topic), e);
                false
            }
        }
    }

    /// Broker -> radio, plus connection bookkeeping.
    pub fn on_event(&mut self, stamped: SessionEvent) -> BridgeOutput {
        if !self.is_open() || stamped.session != self.session {
            debug!("dropping MQTT event from closed session {}", stamped.session);
            return BridgeOutput::Ignored;
        }
        match stamped.event {
            MqttEvent::Connected => {
                self.connected = true;
                if let Some(topic) = self.settings.as_ref().map(|s| s.topic.clone()) {
                    if let Err(e) = self.client.subscribe(&topic) {
                        return BridgeOutput::Error(e.to_string());
                    }
                }
                BridgeOutput::Connected
            }
            MqttEvent::ConnectRefused(reason) => {
                warn!("MQTT broker refused connection: {}", reason);
                self.close();
                BridgeOutput::Error(reason)
            }
            MqttEvent::Disconnected(err) => {
                self.connected = false;
                match err {
                    Some(e) => BridgeOutput::Error(e),
                    None => BridgeOutput::Disconnected,
                }
            }
            MqttEvent::Message {
                topic,
                payload,
                retained,
            } => {
                if is_stat_topic(&topic) {
                    return BridgeOutput::Ignored;
                }
                let proxy = proto::MqttClientProxyMessage {
                    topic,
                    retained,
                    payload_variant: Some(proto::mqtt_client_proxy_message::PayloadVariant::Data(
                        payload,
                    )),
                };
                match codec::mqtt_proxy(proxy) {
                    Ok(frame) => {
                        metrics::inc_mqtt_down();
                        BridgeOutput::ToRadio(frame)
                    }
                    Err(e) => {
                        debug!("dropping MQTT message that does not fit a frame: {}", e);
                        BridgeOutput::Ignored
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttCall {
    Connect(MqttSettings),
    Subscribe(String),
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Disconnect,
}

/// In-memory client that records calls and, by default, acks connects.
#[derive(Debug, Clone)]
pub struct RecordingMqttClient {
    calls: Arc<Mutex<Vec<MqttCall>>>,
    events: Arc<Mutex<Option<MqttEventSender>>>,
    auto_connack: bool,
}

impl Default for RecordingMqttClient {
    fn default() -> Self {
        Self {
            calls: Arc::default(),
            events: Arc::default(),
            auto_connack: true,
        }
    }
}

impl RecordingMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave connects pending; the test delivers `MqttEvent::Connected` itself.
    pub fn without_connack() -> Self {
        Self {
            calls: Arc::default(),
            events: Arc::default(),
            auto_connack: false,
        }
    }

    pub fn calls(&self) -> Vec<MqttCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn published(&self) -> Vec<(String, Bytes, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MqttCall::Publish {
                    topic,
                    payload,
                    retain,
                } => Some((topic, payload, retain)),
                _ => None,
            })
            .collect()
    }

    /// Play broker traffic into the session opened by the last `connect`.
    /// Returns false when no session is open.
    pub fn inject(&self, event: MqttEvent) -> bool {
        self.events
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|tx| tx.send(event)))
            .unwrap_or(false)
    }

    /// Sender of the session opened by the last `connect`, kept even after
    /// that session is closed.
    pub fn sender(&self) -> Option<MqttEventSender> {
        self.events.lock().ok().and_then(|g| g.clone())
    }

    fn record(&self, call: MqttCall) {
        if let Ok(mut c) = self.calls.lock() {
            c.push(call);
        }
    }
}

impl MqttClient for RecordingMqttClient {
    fn connect(&mut self, settings: &MqttSettings, events: MqttEventSender) -> Result<(), MqttError> {
        self.record(MqttCall::Connect(settings.clone()));
        if self.auto_connack {
            events.send(MqttEvent::Connected);
        }
        if let Ok(mut g) = self.events.lock() {
            *g = Some(events);
        }
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.record(MqttCall::Subscribe(topic.to_string()));
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        self.record(MqttCall::Publish {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Ok(mut g) = self.events.lock() {
            *g = None;
        }
        self.record(MqttCall::Disconnect);
    }
}
