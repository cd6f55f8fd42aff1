//! Packet dispatcher.
//!
//! Every decoded `FromRadio` is routed here: bootstrap sub-messages update
//! the session and the store directly, mesh packets are routed by port
//! number. Handlers never write synchronously; they mutate the store's
//! working set and poke the debounce flusher.
mod admin;
mod bootstrap;
pub mod markdown;
mod mesh;
mod text;

pub use bootstrap::{apply_config, apply_module_config};
pub use mesh::{expire_from_wire, expire_to_wire, waypoint_to_wire};

use chrono::Utc;
use log::{debug, error, info, trace};
use std::sync::{Arc, MutexGuard};
use tokio::sync::mpsc;

use crate::config::RuntimePreferences;
use crate::debounce::DebounceHandle;
use crate::events::LinkEvent;
use crate::logutil::escape_log;
use crate::metrics;
use crate::notify::Notifier;
use crate::protobuf::proto;
use crate::protobuf::proto::from_radio::PayloadVariant as FRPayload;
use crate::radio::codec::{self, InboundPacket};
use crate::radio::session::{ConnectionSession, MINIMUM_NODE_NUM};
use crate::store::{NodeRecord, SharedStore, Store, UserRecord};

/// Work the dispatcher hands back to the link loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// The radio wants this published on the broker.
    PublishMqtt(proto::MqttClientProxyMessage),
    /// Config-complete matched the current nonce. Carries the connected
    /// node's MQTT module config when it asks for client proxying.
    HandshakeComplete {
        mqtt: Option<proto::module_config::MqttConfig>,
    },
    /// A routing ack or admin response referenced this request id.
    RequestAnswered(u32),
}

pub struct Dispatcher<S: Store> {
    store: SharedStore<S>,
    notifier: Arc<dyn Notifier>,
    events: mpsc::UnboundedSender<LinkEvent>,
    flusher: DebounceHandle<()>,
    prefs: RuntimePreferences,
    displayed_channel: Option<i32>,
    want_range_test: bool,
    want_store_forward: bool,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(
        store: SharedStore<S>,
        notifier: Arc<dyn Notifier>,
        events: mpsc::UnboundedSender<LinkEvent>,
        flusher: DebounceHandle<()>,
        prefs: RuntimePreferences,
    ) -> Self {
        let want_range_test = prefs.want_range_test_packets;
        let want_store_forward = prefs.want_store_and_forward_packets;
        Self {
            store,
            notifier,
            events,
            flusher,
            prefs,
            displayed_channel: None,
            want_range_test,
            want_store_forward,
        }
    }

    pub fn store(&self) -> &SharedStore<S> {
        &self.store
    }

    pub fn preferences(&self) -> &RuntimePreferences {
        &self.prefs
    }

    /// Channel the UI is showing; its messages do not raise notifications.
    pub fn set_displayed_channel(&mut self, channel: Option<i32>) {
        self.displayed_channel = channel;
    }

    pub fn wants_range_test(&self) -> bool {
        self.want_range_test
    }

    pub fn wants_store_forward(&self) -> bool {
        self.want_store_forward
    }

    /// Opt-ins go back to the configured values when a session ends.
    pub fn reset_session_flags(&mut self) {
        self.want_range_test = self.prefs.want_range_test_packets;
        self.want_store_forward = self.prefs.want_store_and_forward_packets;
    }

    pub fn dispatch(&mut self, session: &mut ConnectionSession, packet: InboundPacket) -> Vec<Effect> {
        let mut effects = Vec::new();
        match packet {
            FRPayload::MyInfo(info) => self.my_info(session, &info),
            FRPayload::NodeInfo(node) => self.node_info(session, &node),
            FRPayload::Channel(channel) => {
                let num = session.node_num();
                self.channel(&channel, num);
            }
            FRPayload::Config(config) => {
                if session.is_invalid_firmware || session.node_num() == 0 {
                    debug!("skipping config (firmware gate or unknown node)");
                } else {
                    self.config(session.node_num(), &config);
                }
            }
            FRPayload::ModuleConfig(config) => {
                if session.is_invalid_firmware || session.node_num() == 0 {
                    debug!("skipping module config (firmware gate or unknown node)");
                } else {
                    self.module_config(session.node_num(), &config);
                }
            }
            FRPayload::Metadata(metadata) => self.connected_metadata(session, &metadata),
            FRPayload::ConfigCompleteId(id) => {
                if let Some(effect) = self.config_complete(session, id, &mut effects) {
                    effects.insert(0, effect);
                }
            }
            FRPayload::MqttClientProxyMessage(message) => {
                effects.push(Effect::PublishMqtt(message));
            }
            FRPayload::LogRecord(record) => {
                info!(target: "radio", "{}", escape_log(&codec::format_log_record(&record)));
            }
            FRPayload::Rebooted(_) => {
                info!("radio reports reboot");
                self.emit(LinkEvent::Rebooted);
            }
            FRPayload::QueueStatus(status) => {
                trace!(
                    "queue status: free {}/{} (packet {}, res {})",
                    status.free,
                    status.maxlen,
                    status.mesh_packet_id,
                    status.res
                );
            }
            FRPayload::Packet(packet) => {
                if session.is_subscribed {
                    self.mesh_packet(session, packet, &mut effects);
                } else if session.defer(packet, self.prefs.deferred_packet_limit) {
                    debug!("deferred packet queue full, dropped oldest");
                    metrics::inc_packets_dropped();
                }
            }
        }
        effects
    }

    /// Route one mesh packet by port number.
    fn mesh_packet(
        &mut self,
        session: &mut ConnectionSession,
        packet: proto::MeshPacket,
        effects: &mut Vec<Effect>,
    ) {
        let Some(proto::mesh_packet::PayloadVariant::Decoded(data)) = packet.payload_variant.clone()
        else {
            debug!("dropping packet {} without decoded payload", packet.id);
            metrics::inc_packets_dropped();
            return;
        };
        metrics::inc_packets_dispatched();
        let port = proto::PortNum::try_from(data.portnum).unwrap_or(proto::PortNum::UnknownApp);
        trace!(
            "packet {} port {:?} from {} to {}",
            packet.id,
            port,
            packet.from,
            packet.to
        );
        match port {
            proto::PortNum::TextMessageApp
            | proto::PortNum::DetectionSensorApp
            | proto::PortNum::ReplyApp => {
                if let Ok(text) = String::from_utf8(data.payload.to_vec()) {
                    self.ingest_text(session, &packet, &data, text, None);
                }
            }
            proto::PortNum::RangeTestApp => {
                if self.want_range_test {
                    if let Ok(text) = String::from_utf8(data.payload.to_vec()) {
                        self.ingest_text(session, &packet, &data, text, None);
                    }
                }
            }
            proto::PortNum::PositionApp => self.position(&packet, &data),
            proto::PortNum::WaypointApp => self.waypoint(&packet, &data),
            proto::PortNum::NodeinfoApp => {
                if !session.is_invalid_firmware {
                    self.node_info_app(session, &packet, &data);
                }
            }
            proto::PortNum::RoutingApp => {
                if !session.is_invalid_firmware {
                    if let Some(id) = self.routing(&packet, &data) {
                        effects.push(Effect::RequestAnswered(id));
                    }
                }
            }
            proto::PortNum::AdminApp => {
                if let Some(id) = self.admin(&packet, &data) {
                    effects.push(Effect::RequestAnswered(id));
                }
            }
            proto::PortNum::StoreForwardApp => {
                if self.want_store_forward {
                    self.store_forward(session, &packet, &data);
                }
            }
            proto::PortNum::TelemetryApp => {
                if !session.is_invalid_firmware {
                    self.telemetry(session, &packet, &data);
                }
            }
            proto::PortNum::TracerouteApp => self.trace_route(&packet, &data),
            proto::PortNum::PaxcounterApp => self.pax(&packet, &data),
            other => trace!("ignoring port {:?}", other),
        }
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Schedule a flush of the working set.
    pub(crate) fn touch(&self) {
        self.flusher.emit(());
    }

    pub(crate) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }
}

pub(crate) fn lock<S: Store>(store: &SharedStore<S>) -> Option<MutexGuard<'_, S>> {
    match store.lock() {
        Ok(guard) => Some(guard),
        Err(_) => {
            error!("store mutex poisoned, dropping update");
            None
        }
    }
}

/// Existing node, or a fresh one heard now with a placeholder user.
pub(crate) fn node_or_stub<S: Store>(db: &S, num: u32) -> NodeRecord {
    db.node(num).unwrap_or_else(|| {
        let mut node = NodeRecord::new(num);
        node.first_heard = Some(Utc::now());
        if num > MINIMUM_NODE_NUM {
            node.user = Some(UserRecord::stub(num));
        }
        node
    })
}
