//! Steady-state mesh traffic: positions, waypoints, node info, routing acks,
//! telemetry, trace routes, store-and-forward and pax counters.
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::{debug, info};
use uuid::Uuid;

use super::bootstrap::{is_usable_position, merge_user};
use super::{lock, node_or_stub, Dispatcher};
use crate::correlator::{apply_routing_ack, timestamp_or_now, RoutingAck};
use crate::events::LinkEvent;
use crate::notify::{Notification, QueueOptions};
use crate::protobuf::proto;
use crate::radio::codec;
use crate::radio::session::{ConnectionSession, BROADCAST_NUM};
use crate::store::{
    MetricsType, PaxRecord, PositionRecord, Store, StoreForwardRecord, TelemetryRecord, TraceRouteHop,
    WaypointRecord,
};

/// Hop positions older than this are not attached to a trace route.
const HOP_POSITION_MAX_AGE_HOURS: i64 = 24;

/// Wire `expire` to an expiry; 0 means never.
pub fn expire_from_wire(expire: u32) -> Option<DateTime<Utc>> {
    if expire == 0 {
        return None;
    }
    Utc.timestamp_opt(i64::from(expire), 0).single()
}

pub fn expire_to_wire(expire: Option<DateTime<Utc>>) -> u32 {
    expire
        .map(|t| t.timestamp().clamp(1, i64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

pub fn waypoint_to_wire(waypoint: &WaypointRecord) -> proto::Waypoint {
    proto::Waypoint {
        id: waypoint.id,
        latitude_i: Some(waypoint.latitude_i),
        longitude_i: Some(waypoint.longitude_i),
        expire: expire_to_wire(waypoint.expire),
        locked_to: waypoint.locked_to,
        name: waypoint.name.clone(),
        description: waypoint.description.clone(),
        icon: waypoint.icon,
    }
}

impl<S: Store> Dispatcher<S> {
    pub(super) fn position(&mut self, packet: &proto::MeshPacket, data: &proto::Data) {
        let position: proto::Position = match codec::decode_payload(&data.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("bad position payload from {}: {}", packet.from, e);
                return;
            }
        };
        let lat = position.latitude_i.unwrap_or(0);
        let lon = position.longitude_i.unwrap_or(0);
        if !is_usable_position(lat, lon) {
            return;
        }
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let mut node = node_or_stub(&*db, packet.from);
        node.snr = packet.rx_snr;
        node.rssi = packet.rx_rssi;
        if packet.rx_time > 0 {
            node.last_heard = Some(timestamp_or_now(packet.rx_time));
        }
        db.append_position(PositionRecord {
            node_num: packet.from,
            latitude_i: lat,
            longitude_i: lon,
            altitude: position.altitude.unwrap_or(0),
            time: timestamp_or_now(if position.time > 0 {
                position.time
            } else {
                packet.rx_time
            }),
            seq_number: position.seq_number,
            precision_bits: position.precision_bits,
            speed: position.ground_speed.unwrap_or(0),
            heading: position.ground_track.unwrap_or(0),
            sats_in_view: position.sats_in_view,
            snr: packet.rx_snr,
            rssi: packet.rx_rssi,
        });
        db.upsert_node(node);
        drop(db);
        self.touch();
        self.emit(LinkEvent::PositionReceived(packet.from));
    }

    /// Waypoints are keyed by the carrying packet's id.
    pub(super) fn waypoint(&mut self, packet: &proto::MeshPacket, data: &proto::Data) {
        let wire: proto::Waypoint = match codec::decode_payload(&data.payload) {
            Ok(w) => w,
            Err(e) => {
                debug!("bad waypoint payload from {}: {}", packet.from, e);
                return;
            }
        };
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let existing = db.waypoint(packet.id);
        let first_sighting = existing.is_none();
        let mut record = existing.unwrap_or_else(|| WaypointRecord {
            id: packet.id,
            created: Some(Utc::now()),
            ..Default::default()
        });
        record.name = wire.name.clone();
        record.description = wire.description.clone();
        record.latitude_i = wire.latitude_i.unwrap_or(0);
        record.longitude_i = wire.longitude_i.unwrap_or(0);
        record.icon = wire.icon;
        record.locked_to = wire.locked_to;
        record.expire = expire_from_wire(wire.expire);
        if !first_sighting {
            record.last_updated = Some(Utc::now());
        }
        db.upsert_waypoint(record.clone());
        drop(db);
        self.touch();
        self.emit(LinkEvent::WaypointReceived {
            id: record.id,
            first_sighting,
        });

        if first_sighting {
            let icon = char::from_u32(record.icon)
                .filter(|c| !c.is_control() && record.icon != 0)
                .unwrap_or('📍');
            let name = if record.name.is_empty() {
                "Dropped Pin"
            } else {
                record.name.as_str()
            };
            let body = if record.description.is_empty() {
                format!(
                    "{}, {}",
                    f64::from(record.latitude_i) / 1e7,
                    f64::from(record.longitude_i) / 1e7
                )
            } else {
                record.description.clone()
            };
            self.notifier().queue(
                Notification {
                    id: format!("notification.id.{}", record.id),
                    title: "New Waypoint Received".into(),
                    subtitle: Some(format!("{} {}", icon, name)),
                    body,
                    path: Some(format!("meshlink:///map?waypointid={}", record.id)),
                },
                QueueOptions::default(),
            );
        }
    }

    /// `nodeinfoApp` carries a bare `User` for the sender.
    pub(super) fn node_info_app(
        &mut self,
        session: &mut ConnectionSession,
        packet: &proto::MeshPacket,
        data: &proto::Data,
    ) {
        let user: proto::User = match codec::decode_payload(&data.payload) {
            Ok(u) => u,
            Err(e) => {
                debug!("bad user payload from {}: {}", packet.from, e);
                return;
            }
        };
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let mut node = node_or_stub(&*db, packet.from);
        node.user = Some(merge_user(packet.from, &user, node.user.take()));
        node.snr = packet.rx_snr;
        node.rssi = packet.rx_rssi;
        node.channel = packet.channel;
        node.via_mqtt = packet.via_mqtt;
        if packet.hop_start > 0 {
            node.hops_away = Some(packet.hop_start.saturating_sub(packet.hop_limit));
        }
        if packet.rx_time > 0 {
            node.last_heard = Some(timestamp_or_now(packet.rx_time));
        }
        db.upsert_node(node);
        drop(db);
        self.touch();
        if packet.from == session.node_num() {
            if !user.short_name.is_empty() {
                session.device.short_name = user.short_name.clone();
            }
            if !user.long_name.is_empty() {
                session.device.long_name = user.long_name.clone();
            }
        }
        self.emit(LinkEvent::NodeInfoReceived(packet.from));
    }

    /// Returns the request id when the ack matched a stored message.
    pub(super) fn routing(&mut self, packet: &proto::MeshPacket, data: &proto::Data) -> Option<u32> {
        let routing: proto::Routing = match codec::decode_payload(&data.payload) {
            Ok(r) => r,
            Err(e) => {
                debug!("bad routing payload from {}: {}", packet.from, e);
                return None;
            }
        };
        let error = match routing.variant {
            Some(proto::routing::Variant::ErrorReason(e)) => e,
            _ => proto::routing::Error::None as i32,
        };
        let ack = RoutingAck {
            request_id: data.request_id,
            from: packet.from,
            to: packet.to,
            rx_time: packet.rx_time,
            rx_snr: packet.rx_snr,
            error,
        };
        let mut db = lock(self.store())?;
        let updated = apply_routing_ack(&mut *db, &ack)?;
        drop(db);
        self.touch();
        self.emit(LinkEvent::MessageAcked {
            message_id: updated.message_id,
            received: updated.received_ack,
            real_ack: updated.real_ack,
            error,
            to: updated.to_num,
            channel: updated.channel,
        });
        Some(data.request_id)
    }

    pub(super) fn telemetry(
        &mut self,
        session: &mut ConnectionSession,
        packet: &proto::MeshPacket,
        data: &proto::Data,
    ) {
        let telemetry: proto::Telemetry = match codec::decode_payload(&data.payload) {
            Ok(t) => t,
            Err(e) => {
                debug!("bad telemetry payload from {}: {}", packet.from, e);
                return;
            }
        };
        let time = timestamp_or_now(telemetry.time);
        let mut sample = match telemetry.variant {
            Some(proto::telemetry::Variant::DeviceMetrics(m)) => {
                let mut s = TelemetryRecord::new(packet.from, MetricsType::Device, time);
                s.battery_level = m.battery_level;
                s.voltage = m.voltage;
                s.channel_utilization = m.channel_utilization;
                s.air_util_tx = m.air_util_tx;
                s.uptime_seconds = m.uptime_seconds;
                s
            }
            Some(proto::telemetry::Variant::EnvironmentMetrics(m)) => {
                let mut s = TelemetryRecord::new(packet.from, MetricsType::Environment, time);
                s.temperature = m.temperature;
                s.relative_humidity = m.relative_humidity;
                s.barometric_pressure = m.barometric_pressure;
                s.gas_resistance = m.gas_resistance;
                s.voltage = m.voltage;
                s.current = m.current;
                s.iaq = m.iaq;
                s.wind_direction = m.wind_direction;
                s.wind_speed = m.wind_speed;
                s.wind_gust = m.wind_gust;
                s.wind_lull = m.wind_lull;
                s.weight = m.weight;
                s
            }
            None => return,
        };
        sample.snr = packet.rx_snr;
        sample.rssi = packet.rx_rssi;

        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let Some(mut node) = db.node(packet.from) else {
            debug!("telemetry from unknown node {}", packet.from);
            return;
        };
        if packet.rx_time > 0 {
            node.last_heard = Some(timestamp_or_now(packet.rx_time));
        }
        let long_name = node.long_name().map(str::to_string);
        let metrics_type = sample.metrics_type;
        let battery = sample.battery_level;
        db.append_telemetry(sample);
        db.upsert_node(node);
        drop(db);
        self.touch();
        self.emit(LinkEvent::TelemetryReceived {
            node: packet.from,
            metrics: metrics_type,
        });

        if metrics_type == MetricsType::Device && packet.from == session.node_num() {
            if let Some(level) = battery {
                self.check_low_battery(session, packet.from, level, long_name);
            }
        }
    }

    /// One notification per below-threshold episode.
    fn check_low_battery(
        &self,
        session: &mut ConnectionSession,
        num: u32,
        level: u32,
        long_name: Option<String>,
    ) {
        let threshold = self.preferences().low_battery_threshold;
        if level == 0 {
            return;
        }
        if level >= threshold {
            session.low_battery_latched = false;
            return;
        }
        if session.low_battery_latched || !self.preferences().low_battery_notifications {
            return;
        }
        session.low_battery_latched = true;
        info!("connected node battery low: {}%", level);
        self.notifier().queue(
            Notification {
                id: format!("notification.id.{}", Uuid::new_v4()),
                title: "Node Battery is Low".into(),
                subtitle: long_name,
                body: format!(
                    "Time to charge your node. There is {}% battery remaining.",
                    level
                ),
                path: Some(format!("meshlink:///nodes?num={}", num)),
            },
            QueueOptions::default(),
        );
    }

    pub(super) fn trace_route(&mut self, packet: &proto::MeshPacket, data: &proto::Data) {
        let discovery: proto::RouteDiscovery = match codec::decode_payload(&data.payload) {
            Ok(r) => r,
            Err(e) => {
                debug!("bad route discovery from {}: {}", packet.from, e);
                return;
            }
        };
        if discovery.route.is_empty() {
            return;
        }
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let Some(mut trace) = db.trace_route(data.request_id) else {
            debug!("route reply {} has no pending trace", data.request_id);
            return;
        };
        let now = Utc::now();
        let cutoff = now - ChronoDuration::hours(HOP_POSITION_MAX_AGE_HOURS);
        let mut hops = Vec::with_capacity(discovery.route.len());
        for &num in &discovery.route {
            if num == BROADCAST_NUM {
                continue;
            }
            let mut node = node_or_stub(&*db, num);
            if packet.rx_time > 0 {
                node.last_heard = Some(timestamp_or_now(packet.rx_time));
            }
            let recent = db.latest_position(num).filter(|p| p.time >= cutoff);
            hops.push(TraceRouteHop {
                num,
                name: node.long_name().unwrap_or("Unknown node").to_string(),
                time: Some(now),
                latitude_i: recent.as_ref().map(|p| p.latitude_i),
                longitude_i: recent.as_ref().map(|p| p.longitude_i),
                altitude: recent.as_ref().map(|p| p.altitude),
            });
            db.upsert_node(node);
        }
        let destination = db.node(trace.to_num);
        let dest_name = destination
            .as_ref()
            .and_then(|n| n.long_name())
            .map(str::to_string)
            .unwrap_or_else(|| format!("!{:08x}", trace.to_num));
        let mut names: Vec<&str> = hops.iter().map(|h| h.name.as_str()).collect();
        names.push(&dest_name);
        let route_text = names.join(" --> ");

        trace.response = true;
        trace.route = discovery.route.clone();
        trace.route_text = Some(route_text.clone());
        trace.hops = hops;
        let request_id = trace.request_id;
        let to_num = trace.to_num;
        db.upsert_trace_route(trace);
        drop(db);
        self.touch();
        info!("trace route {}: {}", request_id, route_text);
        self.emit(LinkEvent::TraceRouteReceived {
            request_id,
            route: route_text,
        });

        if let Some(name) = destination.as_ref().and_then(|n| n.long_name()) {
            self.notifier().queue(
                Notification {
                    id: format!("notification.id.{}", Uuid::new_v4()),
                    title: "Trace Route".into(),
                    subtitle: Some(name.to_string()),
                    body: "Trace route was received".into(),
                    path: Some(format!("meshlink:///nodes?nodenum={}", to_num)),
                },
                QueueOptions::default(),
            );
        }
    }

    pub(super) fn store_forward(
        &mut self,
        session: &mut ConnectionSession,
        packet: &proto::MeshPacket,
        data: &proto::Data,
    ) {
        use proto::store_and_forward::{RequestResponse as RR, Variant};
        let message: proto::StoreAndForward = match codec::decode_payload(&data.payload) {
            Ok(m) => m,
            Err(e) => {
                debug!("bad store-and-forward payload from {}: {}", packet.from, e);
                return;
            }
        };
        match RR::try_from(message.rr).unwrap_or(RR::Unset) {
            RR::RouterHeartbeat => {
                let secondary = match &message.variant {
                    Some(Variant::Heartbeat(h)) => h.secondary,
                    _ => 0,
                };
                self.update_router(packet.from, |sf| {
                    sf.enabled = true;
                    sf.is_router = secondary == 0;
                    sf.last_heartbeat = Some(Utc::now());
                });
            }
            RR::RouterHistory => {
                let last_request = match &message.variant {
                    Some(Variant::History(h)) => h.last_request,
                    _ => 0,
                };
                self.update_router(packet.from, |sf| sf.last_request = last_request);
            }
            rr @ (RR::RouterTextDirect | RR::RouterTextBroadcast) => {
                let Some(Variant::Text(bytes)) = message.variant else {
                    return;
                };
                let Ok(text) = String::from_utf8(bytes.to_vec()) else {
                    return;
                };
                self.ingest_text(
                    session,
                    packet,
                    data,
                    text,
                    Some(rr == RR::RouterTextBroadcast),
                );
            }
            other => debug!("store-and-forward {:?} from {} ignored", other, packet.from),
        }
    }

    fn update_router(&mut self, num: u32, update: impl FnOnce(&mut StoreForwardRecord)) {
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        let Some(mut node) = db.node(num) else {
            return;
        };
        let mut sf = node.store_forward.take().unwrap_or_default();
        update(&mut sf);
        node.store_forward = Some(sf);
        db.upsert_node(node);
        drop(db);
        self.touch();
        self.emit(LinkEvent::StoreForwardUpdated(num));
    }

    pub(super) fn pax(&mut self, packet: &proto::MeshPacket, data: &proto::Data) {
        let pax: proto::Paxcount = match codec::decode_payload(&data.payload) {
            Ok(p) => p,
            Err(e) => {
                debug!("bad pax payload from {}: {}", packet.from, e);
                return;
            }
        };
        let Some(mut db) = lock(self.store()) else {
            return;
        };
        if db.node(packet.from).is_none() {
            return;
        }
        db.append_pax(PaxRecord {
            node_num: packet.from,
            ble: pax.ble,
            wifi: pax.wifi,
            uptime: pax.uptime,
            time: Utc::now(),
        });
        drop(db);
        self.touch();
        self.emit(LinkEvent::PaxReceived(packet.from));
    }
}
