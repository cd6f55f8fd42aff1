//! Test utilities & fixtures.
//! A link wired to a recording transport, an in-memory store and a recording
//! MQTT client, plus builders for the frames a radio would send.
#![allow(dead_code)]

use bytes::Bytes;
use prost::Message;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use meshlink::config::RuntimePreferences;
use meshlink::events::LinkEvent;
use meshlink::mqtt::RecordingMqttClient;
use meshlink::notify::CollectingNotifier;
use meshlink::protobuf::proto;
use meshlink::protobuf::proto::from_radio::PayloadVariant as FRPayload;
use meshlink::radio::codec;
use meshlink::radio::uuids;
use meshlink::radio::{
    start_link, AdapterState, ConnectionState, LinkHandle, RecordingTransport, TransportEvent,
};
use meshlink::store::MeshStore;

pub const PERIPHERAL: &str = "6F1C2A54-0000-4000-8000-00000000BEEF";
pub const MY_NUM: u32 = 0x0bad_cafe;

pub struct Fixture {
    pub handle: LinkHandle,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    pub transport: RecordingTransport,
    pub transport_tx: mpsc::UnboundedSender<TransportEvent>,
    pub store: Arc<Mutex<MeshStore>>,
    pub notifier: CollectingNotifier,
    pub mqtt: RecordingMqttClient,
    pub task: JoinHandle<()>,
}

/// Short timers so timeout paths finish quickly.
pub fn fast_prefs() -> RuntimePreferences {
    let mut prefs = RuntimePreferences::default();
    prefs.connect_timeout = Duration::from_millis(100);
    prefs.handshake_timeout = Duration::from_millis(150);
    prefs.debounce_window = Duration::from_millis(10);
    prefs
}

pub fn start(prefs: RuntimePreferences) -> Fixture {
    start_with_store(prefs, MeshStore::in_memory())
}

pub fn start_with_store(prefs: RuntimePreferences, store: MeshStore) -> Fixture {
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let transport = RecordingTransport::with_responder(transport_tx.clone());
    let store = Arc::new(Mutex::new(store));
    let notifier = CollectingNotifier::new();
    let mqtt = RecordingMqttClient::new();
    let (handle, events, task) = start_link(
        transport.clone(),
        transport_rx,
        store.clone(),
        Arc::new(notifier.clone()),
        mqtt.clone(),
        prefs,
    );
    Fixture {
        handle,
        events,
        transport,
        transport_tx,
        store,
        notifier,
        mqtt,
        task,
    }
}

impl Fixture {
    /// Power on, discover the test peripheral and ask the link to connect.
    pub fn connect(&self) {
        self.transport_tx
            .send(TransportEvent::StateChanged(AdapterState::PoweredOn))
            .unwrap();
        self.transport_tx
            .send(TransportEvent::Discovered {
                peripheral: PERIPHERAL.to_string(),
                name: Some("Meshtastic_beef".to_string()),
                rssi: -58,
            })
            .unwrap();
        self.handle.connect(PERIPHERAL).unwrap();
    }

    /// Connect and feed a full bootstrap that completes with nonce 1.
    pub async fn connect_and_subscribe(&mut self) -> Vec<LinkEvent> {
        for frame in bootstrap_frames(MY_NUM, 1) {
            self.transport.queue_from_radio(frame);
        }
        self.connect();
        let seen = self
            .wait_for(|e| *e == LinkEvent::StateChanged(ConnectionState::Subscribed))
            .await;
        assert!(
            seen.last() == Some(&LinkEvent::StateChanged(ConnectionState::Subscribed)),
            "never subscribed: {:?}",
            seen
        );
        seen
    }

    /// Queue frames and signal from-num, as the radio does when it has data.
    pub fn deliver(&self, frames: Vec<Bytes>) {
        for frame in frames {
            self.transport.queue_from_radio(frame);
        }
        self.transport_tx
            .send(TransportEvent::ValueUpdated {
                peripheral: PERIPHERAL.to_string(),
                characteristic: uuids::FROM_NUM,
                value: Some(Bytes::from_static(&[1, 0, 0, 0])),
                error: None,
            })
            .unwrap();
    }

    /// Collect events up to and including the first match (or until 2s pass).
    pub async fn wait_for(&mut self, pred: impl Fn(&LinkEvent) -> bool) -> Vec<LinkEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => {
                    let hit = pred(&event);
                    seen.push(event);
                    if hit {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        seen
    }

    /// Every `ToRadio` written, decoded.
    pub fn to_radio(&self) -> Vec<proto::to_radio::PayloadVariant> {
        self.transport
            .writes_to(uuids::TO_RADIO)
            .iter()
            .filter_map(|b| codec::decode_to_radio(b).ok())
            .collect()
    }

    /// Mesh packets written to the radio.
    pub fn sent_packets(&self) -> Vec<proto::MeshPacket> {
        self.to_radio()
            .into_iter()
            .filter_map(|p| match p {
                proto::to_radio::PayloadVariant::Packet(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

pub fn frame(variant: FRPayload) -> Bytes {
    codec::encode_from_radio(variant)
}

pub fn bootstrap_frames(num: u32, nonce: u32) -> Vec<Bytes> {
    vec![
        frame(FRPayload::MyInfo(proto::MyNodeInfo {
            my_node_num: num,
            reboot_count: 3,
            min_app_version: 30200,
            ..Default::default()
        })),
        frame(FRPayload::NodeInfo(proto::NodeInfo {
            num,
            user: Some(proto::User {
                id: format!("!{:08x}", num),
                long_name: "Base Camp".into(),
                short_name: "BC".into(),
                ..Default::default()
            }),
            ..Default::default()
        })),
        frame(FRPayload::Channel(proto::Channel {
            index: 0,
            role: proto::channel::Role::Primary as i32,
            settings: Some(proto::ChannelSettings {
                name: "LongFast".into(),
                ..Default::default()
            }),
        })),
        frame(FRPayload::ConfigCompleteId(nonce)),
    ]
}

pub fn mesh_frame(from: u32, to: u32, id: u32, port: proto::PortNum, payload: Vec<u8>) -> Bytes {
    mesh_frame_with(from, to, id, port, payload, 0)
}

pub fn mesh_frame_with(
    from: u32,
    to: u32,
    id: u32,
    port: proto::PortNum,
    payload: Vec<u8>,
    request_id: u32,
) -> Bytes {
    frame(FRPayload::Packet(proto::MeshPacket {
        from,
        to,
        id,
        rx_time: 1_700_000_000,
        rx_snr: 6.0,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: port as i32,
            payload: payload.into(),
            request_id,
            ..Default::default()
        })),
        ..Default::default()
    }))
}

pub fn admin_frame(from: u32, request_id: u32, variant: proto::admin_message::PayloadVariant) -> Bytes {
    let admin = proto::AdminMessage {
        payload_variant: Some(variant),
        ..Default::default()
    };
    mesh_frame_with(
        from,
        from,
        rand::random(),
        proto::PortNum::AdminApp,
        admin.encode_to_vec(),
        request_id,
    )
}
