//! Config-stream sub-messages: identity, channels, config and metadata.
use chrono::Utc;
use log::{debug, info, warn};

use super::{lock, node_or_stub, Dispatcher, Effect};
use crate::correlator::timestamp_or_now;
use crate::events::LinkEvent;
use crate::metrics;
use crate::mqtt;
use crate::protobuf::proto;
use crate::radio::firmware;
use crate::radio::session::{ConnectionSession, MINIMUM_NODE_NUM};
use crate::store::{
    ConfigSection, DeviceMetadataRecord, MetricsType, MyInfoRecord, NodeConfigRecord,
    PositionRecord, Store, TelemetryRecord, UserRecord,
};

/// Well-known placeholder position some firmware reports before a fix.
const PLACEHOLDER_LATITUDE_I: i32 = 373_346_000;
const PLACEHOLDER_LONGITUDE_I: i32 = -1_220_090_000;

pub(crate) fn is_usable_position(latitude_i: i32, longitude_i: i32) -> bool {
    latitude_i != 0
        && longitude_i != 0
        && latitude_i != PLACEHOLDER_LATITUDE_I
        && longitude_i != PLACEHOLDER_LONGITUDE_I
}

/// Store a `Config` section on `record`. Returns the section written.
pub fn apply_config(record: &mut NodeConfigRecord, config: &proto::Config) -> Option<ConfigSection> {
    use proto::config::PayloadVariant as C;
    let section = match config.payload_variant.as_ref()? {
        C::Device(c) => {
            record.set(ConfigSection::Device, c);
            ConfigSection::Device
        }
        C::Position(c) => {
            record.set(ConfigSection::Position, c);
            ConfigSection::Position
        }
        C::Power(c) => {
            record.set(ConfigSection::Power, c);
            ConfigSection::Power
        }
        C::Network(c) => {
            record.set(ConfigSection::Network, c);
            ConfigSection::Network
        }
        C::Display(c) => {
            record.set(ConfigSection::Display, c);
            ConfigSection::Display
        }
        C::Lora(c) => {
            record.set(ConfigSection::Lora, c);
            ConfigSection::Lora
        }
        C::Bluetooth(c) => {
            record.set(ConfigSection::Bluetooth, c);
            ConfigSection::Bluetooth
        }
    };
    Some(section)
}

/// Store a `ModuleConfig` section on `record`. Returns the section written.
pub fn apply_module_config(
    record: &mut NodeConfigRecord,
    config: &proto::ModuleConfig,
) -> Option<ConfigSection> {
    use proto::module_config::PayloadVariant as M;
    let section = match config.payload_variant.as_ref()? {
        M::Mqtt(c) => {
            record.set(ConfigSection::Mqtt, c);
            ConfigSection::Mqtt
        }
        M::Serial(c) => {
            record.set(ConfigSection::Serial, c);
            ConfigSection::Serial
        }
        M::ExternalNotification(c) => {
            record.set(ConfigSection::ExternalNotification, c);
            ConfigSection::ExternalNotification
        }
        M::StoreForward(c) => {
            record.set(ConfigSection::StoreForward, c);
            ConfigSection::StoreForward
        }
        M::RangeTest(c) => {
            record.set(ConfigSection::RangeTest, c);
            ConfigSection::RangeTest
        }
        M::Telemetry(c) => {
            record.set(ConfigSection::Telemetry, c);
            ConfigSection::Telemetry
        }
        M::CannedMessage(c) => {
            record.set(ConfigSection::CannedMessage, c);
            ConfigSection::CannedMessage
        }
        M::AmbientLighting(c) => {
            record.set(ConfigSection::AmbientLighting, c);
            ConfigSection::AmbientLighting
        }
        M::DetectionSensor(c) => {
            record.set(ConfigSection::DetectionSensor, c);
            ConfigSection::DetectionSensor
        }
        M::Paxcounter(c) => {
            record.set(ConfigSection::Paxcounter, c);
            ConfigSection::Paxcounter
        }
    };
    Some(section)
}

/// Merge a wire `User` into the stored one. Local-only fields survive and a
/// public key is only adopted when none is stored yet.
pub(crate) fn merge_user(num: u32, user: &proto::User, existing: Option<UserRecord>) -> UserRecord {
    let mut record = existing.unwrap_or_default();
    record.num = num;
    record.user_id = user.id.clone();
    record.long_name = user.long_name.clone();
    record.short_name = user.short_name.clone();
    record.hw_model = user.hw_model;
    record.is_licensed = user.is_licensed;
    record.role = user.role;
    if record.public_key.is_none() && !user.public_key.is_empty() {
        record.pki_encrypted = true;
        record.public_key = Some(user.public_key.to_vec());
    }
    record
}

pub(crate) fn metadata_record(metadata: &proto::DeviceMetadata) -> DeviceMetadataRecord {
    DeviceMetadataRecord {
        firmware_version: firmware::parse_version(&metadata.firmware_version).version,
        device_state_version: metadata.device_state_version,
        can_shutdown: metadata.can_shutdown,
        has_wifi: metadata.has_wifi,
        has_bluetooth: metadata.has_bluetooth,
        has_ethernet: metadata.has_ethernet,
        role: metadata.role,
        position_flags: metadata.position_flags,
        hw_model: metadata.hw_model,
        has_remote_hardware: metadata.has_remote_hardware,
        time: Some(Utc::now()),
    }
}

impl<S: Store> Dispatcher<S> {
    pub(super) fn my_info(&mut self, session: &mut ConnectionSession, info: &proto::MyNodeInfo) {
        if info.my_node_num == 0 {
            return;
        }
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let mut record = db.my_info(info.my_node_num).unwrap_or_else(|| MyInfoRecord {
            my_node_num: info.my_node_num,
            ..Default::default()
        });
        record.peripheral_id = session.peripheral_id().to_string();
        record.reboot_count = info.reboot_count;
        record.min_app_version = info.min_app_version;
        db.upsert_my_info(record);
        drop(db);
        self.touch();

        info!("connected radio is node {}", info.my_node_num);
        session.device.num = info.my_node_num;
        self.emit(LinkEvent::MyInfoReceived(info.my_node_num));
    }

    pub(super) fn node_info(&mut self, session: &mut ConnectionSession, info: &proto::NodeInfo) {
        if info.num == 0 {
            return;
        }
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let heard = (info.last_heard > 0).then(|| timestamp_or_now(info.last_heard));
        let mut node = db.node(info.num).unwrap_or_else(|| {
            let mut n = crate::store::NodeRecord::new(info.num);
            n.first_heard = heard;
            n
        });
        node.last_heard = heard.or(node.last_heard);
        node.snr = info.snr;
        node.channel = info.channel;
        node.via_mqtt = info.via_mqtt;
        node.is_favorite = info.is_favorite;
        node.hops_away = info.hops_away;
        match &info.user {
            Some(user) => node.user = Some(merge_user(info.num, user, node.user.take())),
            None if node.user.is_none() && info.num > MINIMUM_NODE_NUM => {
                node.user = Some(UserRecord::stub(info.num))
            }
            None => {}
        }

        if let Some(metrics) = &info.device_metrics {
            let mut sample = TelemetryRecord::new(
                info.num,
                MetricsType::Device,
                heard.unwrap_or_else(Utc::now),
            );
            sample.battery_level = metrics.battery_level;
            sample.voltage = metrics.voltage;
            sample.channel_utilization = metrics.channel_utilization;
            sample.air_util_tx = metrics.air_util_tx;
            sample.uptime_seconds = metrics.uptime_seconds;
            let latest = db
                .telemetry(info.num)
                .into_iter()
                .rev()
                .find(|t| t.metrics_type == MetricsType::Device);
            let same = latest.map_or(false, |t| {
                t.battery_level == sample.battery_level
                    && t.voltage == sample.voltage
                    && t.channel_utilization == sample.channel_utilization
                    && t.air_util_tx == sample.air_util_tx
            });
            if !same {
                db.append_telemetry(sample);
            }
        }

        if let Some(position) = &info.position {
            let lat = position.latitude_i.unwrap_or(0);
            let lon = position.longitude_i.unwrap_or(0);
            if is_usable_position(lat, lon) {
                let sample = PositionRecord {
                    node_num: info.num,
                    latitude_i: lat,
                    longitude_i: lon,
                    altitude: position.altitude.unwrap_or(0),
                    time: timestamp_or_now(position.time),
                    seq_number: position.seq_number,
                    precision_bits: position.precision_bits,
                    speed: position.ground_speed.unwrap_or(0),
                    heading: position.ground_track.unwrap_or(0),
                    sats_in_view: position.sats_in_view,
                    snr: info.snr,
                    rssi: 0,
                };
                let duplicate = db.latest_position(info.num).map_or(false, |p| {
                    p.latitude_i == lat && p.longitude_i == lon && (position.time == 0 || p.time == sample.time)
                });
                if !duplicate {
                    db.append_position(sample);
                }
            }
        }

        if info.num == session.node_num() {
            if let Some(user) = &node.user {
                session.device.short_name = if user.short_name.is_empty() {
                    "?".into()
                } else {
                    user.short_name.clone()
                };
                session.device.long_name = if user.long_name.is_empty() {
                    "Unknown node".into()
                } else {
                    user.long_name.clone()
                };
            }
        }
        db.upsert_node(node);
        drop(db);
        self.touch();
        self.emit(LinkEvent::NodeInfoReceived(info.num));
    }

    /// Upsert a channel on the my-info of `node_num`.
    pub(super) fn channel(&mut self, channel: &proto::Channel, node_num: u32) {
        let Some(settings) = &channel.settings else {
            return;
        };
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let Some(mut info) = db.my_info(node_num) else {
            debug!("channel {} for unknown node {}", channel.index, node_num);
            return;
        };
        let mut record = info.channel(channel.index).cloned().unwrap_or_default();
        record.index = channel.index;
        record.name = settings.name.clone();
        record.psk = settings.psk.to_vec();
        record.role = channel.role;
        record.uplink_enabled = settings.uplink_enabled;
        record.downlink_enabled = settings.downlink_enabled;
        if let Some(module) = &settings.module_settings {
            record.position_precision = module.position_precision;
            record.mute = module.is_client_muted;
        }
        if settings.name.eq_ignore_ascii_case("admin") {
            info.admin_index = Some(channel.index);
        }
        let disabled = record.is_disabled();
        info.upsert_channel(record);
        db.upsert_my_info(info);
        drop(db);
        self.touch();
        if !disabled {
            self.emit(LinkEvent::ChannelReceived(channel.index));
        }
    }

    pub(super) fn config(&mut self, node_num: u32, config: &proto::Config) {
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let mut record = db.node_config(node_num).unwrap_or_default();
        let Some(section) = apply_config(&mut record, config) else {
            return;
        };
        db.upsert_node_config(node_num, record);
        drop(db);
        self.touch();
        self.emit(LinkEvent::ConfigReceived {
            node: node_num,
            section,
        });
    }

    pub(super) fn module_config(&mut self, node_num: u32, config: &proto::ModuleConfig) {
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let mut record = db.node_config(node_num).unwrap_or_default();
        let Some(section) = apply_module_config(&mut record, config) else {
            return;
        };
        db.upsert_node_config(node_num, record);
        drop(db);
        self.touch();
        self.emit(LinkEvent::ConfigReceived {
            node: node_num,
            section,
        });
    }

    /// Attach metadata to `node_num`, creating the node when needed.
    pub(super) fn metadata(&mut self, node_num: u32, metadata: &proto::DeviceMetadata) {
        if node_num == 0 {
            return;
        }
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let mut node = node_or_stub(&*db, node_num);
        node.metadata = Some(metadata_record(metadata));
        db.upsert_node(node);
        drop(db);
        self.touch();
    }

    /// Metadata of the connected radio runs the firmware gate.
    pub(super) fn connected_metadata(
        &mut self,
        session: &mut ConnectionSession,
        metadata: &proto::DeviceMetadata,
    ) {
        if metadata.firmware_version.is_empty() || session.is_invalid_firmware {
            return;
        }
        session.device.firmware_version = metadata.firmware_version.clone();
        self.metadata(session.node_num(), metadata);

        let parsed = firmware::parse_version(&metadata.firmware_version);
        if !parsed.valid {
            warn!(
                "unparseable firmware version {:?}, treating as {}",
                metadata.firmware_version,
                firmware::UNKNOWN_VERSION
            );
            session.is_invalid_firmware = true;
        }
        let minimum = self.preferences().minimum_firmware_version.clone();
        let supported = firmware::is_supported(&parsed.version, &minimum);
        if !supported {
            warn!(
                "firmware {} is older than the supported minimum {}",
                parsed.version, minimum
            );
            session.is_invalid_firmware = true;
            session.last_connection_error = Some(firmware::upgrade_required_message(&minimum));
        }
        session.firmware_version = Some(parsed.version.clone());
        self.emit(LinkEvent::MetadataReceived {
            node: session.node_num(),
            firmware_version: parsed.version,
            supported,
        });
    }

    /// Handle a config-complete id. Deferred packets are dispatched into
    /// `effects`; the completion effect itself is returned.
    pub(super) fn config_complete(
        &mut self,
        session: &mut ConnectionSession,
        id: u32,
        effects: &mut Vec<Effect>,
    ) -> Option<Effect> {
        if !session.completes_handshake(id) {
            debug!("ignoring stale config-complete {} (current {})", id, session.nonce);
            return None;
        }
        let minimum = self.preferences().minimum_firmware_version.clone();
        let gate_failed = session
            .firmware_version
            .as_deref()
            .map_or(false, |v| !firmware::is_supported(v, &minimum));
        if !gate_failed {
            session.is_invalid_firmware = false;
            session.last_connection_error = None;
        }
        session.is_subscribed = true;
        session.handshake_started = None;
        metrics::inc_handshakes_completed();
        info!(
            "config handshake complete for node {} (nonce {})",
            session.node_num(),
            id
        );

        let num = session.node_num();
        let mut mqtt_config = None;
        if num > 0 {
            let snapshot = lock(self.store()).map(|db| {
                (
                    db.node(num).is_some(),
                    db.node_config(num),
                    db.unread_counts(num),
                )
            });
            if let Some((known, config, unread)) = snapshot {
                if known {
                    self.emit(LinkEvent::UnreadCounts(unread));
                }
                if let Some(config) = config {
                    if config.range_test().map_or(false, |c| c.enabled) {
                        self.want_range_test = true;
                    }
                    if config.store_forward().map_or(false, |c| c.enabled) {
                        self.want_store_forward = true;
                    }
                    mqtt_config = config.mqtt().filter(mqtt::wants_proxy);
                }
            }
        }
        self.emit(LinkEvent::WantConfigFinished { nonce: id });

        while let Some(packet) = session.deferred.pop_front() {
            self.mesh_packet(session, packet, effects);
        }
        Some(Effect::HandshakeComplete { mqtt: mqtt_config })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use crate::config::RuntimePreferences;
    use crate::events::LinkEvent;
    use crate::protobuf::proto;
    use crate::protobuf::proto::from_radio::PayloadVariant as FRPayload;
    use crate::store::{ConfigSection, MyInfoRecord, Store};

    fn node_info(num: u32) -> proto::NodeInfo {
        proto::NodeInfo {
            num,
            user: Some(proto::User {
                id: format!("!{:08x}", num),
                long_name: "Base Camp".into(),
                short_name: "BC".into(),
                public_key: vec![7u8; 32].into(),
                ..Default::default()
            }),
            position: Some(proto::Position {
                latitude_i: Some(475_000_000),
                longitude_i: Some(85_000_000),
                time: 1_700_000_100,
                ..Default::default()
            }),
            device_metrics: Some(proto::DeviceMetrics {
                battery_level: Some(80),
                voltage: Some(4.0),
                ..Default::default()
            }),
            snr: 7.25,
            last_heard: 1_700_000_200,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn node_info_is_idempotent() {
        let mut h = Harness::new(RuntimePreferences::default());
        h.dispatch(FRPayload::NodeInfo(node_info(55)));
        let once = {
            let db = h.store.lock().unwrap();
            (db.node(55).unwrap(), db.telemetry(55).len(), db.latest_position(55))
        };
        h.dispatch(FRPayload::NodeInfo(node_info(55)));
        let db = h.store.lock().unwrap();
        assert_eq!(db.node(55).unwrap(), once.0);
        assert_eq!(db.telemetry(55).len(), once.1);
        assert_eq!(db.latest_position(55), once.2);
        let user = once.0.user.unwrap();
        assert!(user.pki_encrypted);
        assert_eq!(user.long_name, "Base Camp");
    }

    #[tokio::test]
    async fn placeholder_position_is_ignored() {
        let mut h = Harness::new(RuntimePreferences::default());
        let mut info = node_info(56);
        info.position = Some(proto::Position {
            latitude_i: Some(373_346_000),
            longitude_i: Some(-1_220_090_000),
            ..Default::default()
        });
        h.dispatch(FRPayload::NodeInfo(info));
        assert!(h.store.lock().unwrap().latest_position(56).is_none());
    }

    #[tokio::test]
    async fn admin_channel_index_is_recorded() {
        let mut h = Harness::new(RuntimePreferences::default());
        h.store.lock().unwrap().upsert_my_info(MyInfoRecord {
            my_node_num: 10,
            ..Default::default()
        });
        h.dispatch(FRPayload::Channel(proto::Channel {
            index: 2,
            role: proto::channel::Role::Secondary as i32,
            settings: Some(proto::ChannelSettings {
                name: "Admin".into(),
                ..Default::default()
            }),
        }));
        let info = h.store.lock().unwrap().my_info(10).unwrap();
        assert_eq!(info.admin_index, Some(2));
        assert!(h.drain_events().contains(&LinkEvent::ChannelReceived(2)));
    }

    #[tokio::test]
    async fn firmware_gate_blocks_config() {
        let mut prefs = RuntimePreferences::default();
        prefs.minimum_firmware_version = "2.3.0".into();
        let mut h = Harness::new(prefs);
        h.dispatch(FRPayload::Metadata(proto::DeviceMetadata {
            firmware_version: "2.2.19.abcdef".into(),
            ..Default::default()
        }));
        assert!(h.session.is_invalid_firmware);
        assert!(h.session.last_connection_error.as_deref().unwrap().starts_with("🚨"));

        h.dispatch(FRPayload::Config(proto::Config {
            payload_variant: Some(proto::config::PayloadVariant::Lora(Default::default())),
        }));
        assert!(h.store.lock().unwrap().node_config(10).is_none());

        // completion does not lift a failed gate
        h.session.is_subscribed = false;
        h.dispatch(FRPayload::ConfigCompleteId(1));
        assert!(h.session.is_invalid_firmware);
    }

    #[tokio::test]
    async fn hash_only_version_marks_invalid_but_supported() {
        let mut h = Harness::new(RuntimePreferences::default());
        h.dispatch(FRPayload::Metadata(proto::DeviceMetadata {
            firmware_version: "d55c08d".into(),
            ..Default::default()
        }));
        assert!(h.session.is_invalid_firmware);
        assert!(h.session.last_connection_error.is_none());
        assert_eq!(h.session.firmware_version.as_deref(), Some("0.0.0"));
        let events = h.drain_events();
        assert!(events.contains(&LinkEvent::MetadataReceived {
            node: 10,
            firmware_version: "0.0.0".into(),
            supported: true,
        }));
    }

    #[tokio::test]
    async fn module_config_is_stored_per_node() {
        let mut h = Harness::new(RuntimePreferences::default());
        h.dispatch(FRPayload::ModuleConfig(proto::ModuleConfig {
            payload_variant: Some(proto::module_config::PayloadVariant::RangeTest(
                proto::module_config::RangeTestConfig {
                    enabled: true,
                    ..Default::default()
                },
            )),
        }));
        let cfg = h.store.lock().unwrap().node_config(10).unwrap();
        assert!(cfg.range_test().unwrap().enabled);
        assert!(h.drain_events().contains(&LinkEvent::ConfigReceived {
            node: 10,
            section: ConfigSection::RangeTest,
        }));
    }
}
