//! Persisted object graph consumed by the dispatcher.
//!
//! The link engine only talks to the [`Store`] trait. Mutations land in an
//! in-memory working set and become durable once flushed. The debounce
//! scheduler flushes in three steps: [`Store::begin_flush`] captures the
//! working set under the lock, [`Store::persist`] writes it with the lock
//! released, and [`Store::commit_flush`] or [`Store::abort_flush`] settles
//! the result.
//!
//! [`MeshStore`] is the bundled implementation: BTreeMaps kept as a
//! committed/working pair, optionally mirrored to a JSON snapshot file.

mod json;

pub use json::MeshStore;

use crate::errors::StoreError;
use crate::protobuf::proto;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Store shared between the dispatch loop and the flush worker.
pub type SharedStore<S> = Arc<Mutex<S>>;

/// Record of the node we are paired with, as reported by my-info.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MyInfoRecord {
    pub my_node_num: u32,
    pub peripheral_id: String,
    pub reboot_count: u32,
    pub min_app_version: u32,
    /// Index of the channel named "admin", when one exists.
    pub admin_index: Option<i32>,
    pub channels: Vec<ChannelRecord>,
}

impl MyInfoRecord {
    pub fn channel(&self, index: i32) -> Option<&ChannelRecord> {
        self.channels.iter().find(|c| c.index == index)
    }

    /// Insert or replace the channel with the same index, keeping index order.
    pub fn upsert_channel(&mut self, channel: ChannelRecord) {
        match self.channels.iter_mut().find(|c| c.index == channel.index) {
            Some(existing) => *existing = channel,
            None => {
                self.channels.push(channel);
                self.channels.sort_by_key(|c| c.index);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub index: i32,
    pub name: String,
    pub psk: Vec<u8>,
    /// `proto::channel::Role` as i32.
    pub role: i32,
    pub uplink_enabled: bool,
    pub downlink_enabled: bool,
    pub position_precision: u32,
    pub mute: bool,
}

impl ChannelRecord {
    pub fn is_disabled(&self) -> bool {
        self.role == proto::channel::Role::Disabled as i32
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("#{}", self.index)
        } else {
            self.name.clone()
        }
    }
}

/// Result of comparing a direct message's key against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMatch {
    Matching,
    NotMatching,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub num: u32,
    pub user_id: String,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: u32,
    pub is_licensed: bool,
    pub role: u32,
    pub public_key: Option<Vec<u8>>,
    /// Sender has been seen using PKI encryption.
    pub pki_encrypted: bool,
    pub key_match: Option<KeyMatch>,
    pub mute: bool,
    pub last_message: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Placeholder identity for a node we have not received a user for.
    pub fn stub(num: u32) -> Self {
        let user_id = format!("!{:08x}", num);
        let short_name = user_id[user_id.len() - 4..].to_string();
        Self {
            num,
            long_name: format!("Meshtastic {}", short_name),
            short_name,
            user_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadataRecord {
    pub firmware_version: String,
    pub device_state_version: u32,
    pub can_shutdown: bool,
    pub has_wifi: bool,
    pub has_bluetooth: bool,
    pub has_ethernet: bool,
    pub role: u32,
    pub position_flags: u32,
    pub hw_model: u32,
    pub has_remote_hardware: bool,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreForwardRecord {
    pub enabled: bool,
    pub is_router: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_request: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub num: u32,
    pub user: Option<UserRecord>,
    pub snr: f32,
    pub rssi: i32,
    pub channel: u32,
    pub via_mqtt: bool,
    pub hops_away: Option<u32>,
    pub is_favorite: bool,
    pub first_heard: Option<DateTime<Utc>>,
    pub last_heard: Option<DateTime<Utc>>,
    pub metadata: Option<DeviceMetadataRecord>,
    pub store_forward: Option<StoreForwardRecord>,
}

impl NodeRecord {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            ..Default::default()
        }
    }

    pub fn long_name(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.long_name.as_str())
            .filter(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub node_num: u32,
    pub latitude_i: i32,
    pub longitude_i: i32,
    pub altitude: i32,
    pub time: DateTime<Utc>,
    pub seq_number: u32,
    pub precision_bits: u32,
    pub speed: u32,
    pub heading: u32,
    pub sats_in_view: u32,
    pub snr: f32,
    pub rssi: i32,
}

impl PositionRecord {
    pub fn latitude(&self) -> f64 {
        f64::from(self.latitude_i) / 1e7
    }

    pub fn longitude(&self) -> f64 {
        f64::from(self.longitude_i) / 1e7
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricsType {
    Device,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub node_num: u32,
    pub metrics_type: MetricsType,
    pub time: DateTime<Utc>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
    pub gas_resistance: Option<f32>,
    pub current: Option<f32>,
    pub iaq: Option<u32>,
    pub wind_direction: Option<u32>,
    pub wind_speed: Option<f32>,
    pub wind_gust: Option<f32>,
    pub wind_lull: Option<f32>,
    pub weight: Option<f32>,
    pub snr: f32,
    pub rssi: i32,
}

impl TelemetryRecord {
    pub fn new(node_num: u32, metrics_type: MetricsType, time: DateTime<Utc>) -> Self {
        Self {
            node_num,
            metrics_type,
            time,
            battery_level: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            uptime_seconds: None,
            temperature: None,
            relative_humidity: None,
            barometric_pressure: None,
            gas_resistance: None,
            current: None,
            iaq: None,
            wind_direction: None,
            wind_speed: None,
            wind_gust: None,
            wind_lull: None,
            weight: None,
            snr: 0.0,
            rssi: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaxRecord {
    pub node_num: u32,
    pub ble: u32,
    pub wifi: u32,
    pub uptime: u32,
    pub time: DateTime<Utc>,
}

/// Config sections persisted per node as encoded protobuf bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigSection {
    Device,
    Position,
    Power,
    Network,
    Display,
    Lora,
    Bluetooth,
    Mqtt,
    Serial,
    ExternalNotification,
    StoreForward,
    RangeTest,
    Telemetry,
    CannedMessage,
    AmbientLighting,
    DetectionSensor,
    Paxcounter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfigRecord {
    pub sections: BTreeMap<ConfigSection, Vec<u8>>,
    pub canned_messages: Option<String>,
    pub ringtone: Option<String>,
}

impl NodeConfigRecord {
    pub fn set<M: prost::Message>(&mut self, section: ConfigSection, value: &M) {
        self.sections.insert(section, value.encode_to_vec());
    }

    /// Decoded section, or `None` when absent or undecodable.
    pub fn get<M: prost::Message + Default>(&self, section: ConfigSection) -> Option<M> {
        self.sections
            .get(&section)
            .and_then(|raw| M::decode(raw.as_slice()).ok())
    }

    pub fn mqtt(&self) -> Option<proto::module_config::MqttConfig> {
        self.get(ConfigSection::Mqtt)
    }

    pub fn range_test(&self) -> Option<proto::module_config::RangeTestConfig> {
        self.get(ConfigSection::RangeTest)
    }

    pub fn store_forward(&self) -> Option<proto::module_config::StoreForwardConfig> {
        self.get(ConfigSection::StoreForward)
    }

    pub fn lora(&self) -> Option<proto::config::LoRaConfig> {
        self.get(ConfigSection::Lora)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: u32,
    pub from_num: u32,
    /// Recipient for direct messages; `None` for channel broadcasts.
    pub to_num: Option<u32>,
    pub channel: i32,
    pub portnum: i32,
    pub text: String,
    pub markdown: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub is_emoji: bool,
    pub reply_id: Option<u32>,
    pub admin: bool,
    pub admin_description: Option<String>,
    pub store_forward: bool,
    pub pki_encrypted: bool,
    pub public_key: Option<Vec<u8>>,
    pub rx_snr: f32,
    pub rx_rssi: i32,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub via_mqtt: bool,
    pub received_ack: bool,
    pub real_ack: bool,
    pub ack_timestamp: Option<DateTime<Utc>>,
    pub ack_snr: Option<f32>,
    /// `proto::routing::Error` as i32.
    pub ack_error: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointRecord {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub icon: u32,
    pub latitude_i: i32,
    pub longitude_i: i32,
    /// `None` means the waypoint never expires.
    pub expire: Option<DateTime<Utc>>,
    pub locked_to: u32,
    pub created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRouteHop {
    pub num: u32,
    pub name: String,
    pub time: Option<DateTime<Utc>>,
    pub latitude_i: Option<i32>,
    pub longitude_i: Option<i32>,
    pub altitude: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRouteRecord {
    pub request_id: u32,
    pub to_num: u32,
    pub sent: Option<DateTime<Utc>>,
    pub response: bool,
    pub route: Vec<u32>,
    pub route_text: Option<String>,
    pub hops: Vec<TraceRouteHop>,
    pub node_position: Option<PositionRecord>,
}

/// Unread message counters for the connected node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadCounts {
    pub direct: u32,
    pub channels: BTreeMap<i32, u32>,
}

/// Capability surface the dispatcher needs from persistence.
///
/// A working-set capture plus the mutation count it was taken at.
#[derive(Debug)]
pub struct FlushTicket<T> {
    pub generation: u64,
    pub snapshot: T,
}

/// Reads return owned copies; writes replace by key. Nothing is durable
/// until [`Store::flush`] succeeds.
pub trait Store: Send + 'static {
    fn my_info(&self, num: u32) -> Option<MyInfoRecord>;
    fn upsert_my_info(&mut self, info: MyInfoRecord);

    fn node(&self, num: u32) -> Option<NodeRecord>;
    fn upsert_node(&mut self, node: NodeRecord);
    fn nodes(&self) -> Vec<NodeRecord>;

    fn append_position(&mut self, position: PositionRecord);
    fn latest_position(&self, num: u32) -> Option<PositionRecord>;

    fn append_telemetry(&mut self, telemetry: TelemetryRecord);
    fn telemetry(&self, num: u32) -> Vec<TelemetryRecord>;

    fn append_pax(&mut self, pax: PaxRecord);
    fn pax(&self, num: u32) -> Vec<PaxRecord>;

    fn node_config(&self, num: u32) -> Option<NodeConfigRecord>;
    fn upsert_node_config(&mut self, num: u32, config: NodeConfigRecord);

    fn message(&self, id: u32) -> Option<MessageRecord>;
    fn upsert_message(&mut self, message: MessageRecord);
    fn messages(&self) -> Vec<MessageRecord>;

    fn waypoint(&self, id: u32) -> Option<WaypointRecord>;
    fn upsert_waypoint(&mut self, waypoint: WaypointRecord);

    fn trace_route(&self, request_id: u32) -> Option<TraceRouteRecord>;
    fn upsert_trace_route(&mut self, trace: TraceRouteRecord);

    fn has_changes(&self) -> bool;

    /// Working set as captured by [`Store::begin_flush`].
    type Snapshot: Send + 'static;

    /// Capture the working set for writing. `None` when nothing changed.
    fn begin_flush(&mut self) -> Option<FlushTicket<Self::Snapshot>>;
    /// Write a captured snapshot. Called with the store lock released.
    fn persist(snapshot: &Self::Snapshot) -> Result<(), StoreError>;
    /// Promote a written snapshot. Mutations made after the capture stay pending.
    fn commit_flush(&mut self, ticket: FlushTicket<Self::Snapshot>);
    /// Roll back after a failed write, unless the working set moved on since
    /// the capture. Returns whether it rolled back.
    fn abort_flush(&mut self, generation: u64) -> bool;

    /// Capture, write and commit in one go while holding `&mut self`.
    fn flush(&mut self) -> Result<(), StoreError> {
        let Some(ticket) = self.begin_flush() else {
            return Ok(());
        };
        Self::persist(&ticket.snapshot)?;
        self.commit_flush(ticket);
        Ok(())
    }

    /// Discard every mutation since the last successful flush.
    fn rollback(&mut self);

    fn unread_counts(&self, my_num: u32) -> UnreadCounts {
        let mut counts = UnreadCounts::default();
        for m in self.messages().into_iter().filter(|m| !m.read && !m.admin) {
            match m.to_num {
                Some(to) if to == my_num => counts.direct += 1,
                Some(_) => {}
                None => *counts.channels.entry(m.channel).or_default() += 1,
            }
        }
        counts
    }
}
