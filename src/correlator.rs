//! Admin request correlation.
//!
//! Outbound admin messages are fire-and-forget. Each one is stored as an
//! admin [`MessageRecord`] whose `message_id` is the mesh packet id, and a
//! [`PendingAdminRequest`] remembers what it was for. Routing acks and admin
//! responses carry that id back as `request_id`; a miss is a silent no-op.
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics;
use crate::protobuf::proto;
use crate::radio::codec;
use crate::store::{ConfigSection, MessageRecord, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminIntent {
    /// `proto::admin_message::ConfigType` as i32.
    RequestConfig(i32),
    /// `proto::admin_message::ModuleConfigType` as i32.
    RequestModuleConfig(i32),
    RequestChannel(i32),
    RequestDeviceMetadata,
    RequestCannedMessages,
    RequestRingtone,
    SaveConfig(ConfigSection),
    SaveModuleConfig(ConfigSection),
    SaveChannel(i32),
    SaveOwner,
    Reboot(i32),
}

impl AdminIntent {
    pub fn description(&self) -> String {
        match self {
            AdminIntent::RequestConfig(t) => format!(
                "Requested {}",
                proto::admin_message::ConfigType::try_from(*t)
                    .map(|c| c.as_str_name())
                    .unwrap_or("UNKNOWN_CONFIG")
            ),
            AdminIntent::RequestModuleConfig(t) => format!(
                "Requested {}",
                proto::admin_message::ModuleConfigType::try_from(*t)
                    .map(|c| c.as_str_name())
                    .unwrap_or("UNKNOWN_MODULE_CONFIG")
            ),
            AdminIntent::RequestChannel(i) => format!("Requested channel {}", i),
            AdminIntent::RequestDeviceMetadata => "Requested device metadata".into(),
            AdminIntent::RequestCannedMessages => "Requested canned messages".into(),
            AdminIntent::RequestRingtone => "Requested ringtone".into(),
            AdminIntent::SaveConfig(s) => format!("Saved {:?} config", s),
            AdminIntent::SaveModuleConfig(s) => format!("Saved {:?} module config", s),
            AdminIntent::SaveChannel(i) => format!("Saved channel {}", i),
            AdminIntent::SaveOwner => "Saved user".into(),
            AdminIntent::Reboot(secs) => format!("Reboot in {} seconds", secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAdminRequest {
    pub request_id: u32,
    pub intent: AdminIntent,
    pub to: u32,
    pub sent_at: Instant,
}

/// Outstanding admin requests, pruned by TTL.
#[derive(Debug)]
pub struct AdminCorrelator {
    pending: HashMap<u32, PendingAdminRequest>,
    ttl: Duration,
}

impl AdminCorrelator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            ttl,
        }
    }

    pub fn register(&mut self, request: PendingAdminRequest) {
        self.pending.insert(request.request_id, request);
    }

    pub fn resolve(&mut self, request_id: u32) -> Option<PendingAdminRequest> {
        self.pending.remove(&request_id)
    }

    pub fn is_pending(&self, request_id: u32) -> bool {
        self.pending.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return requests older than the TTL, oldest first.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingAdminRequest> {
        let ttl = self.ttl;
        let stale: Vec<u32> = self
            .pending
            .values()
            .filter(|p| now.saturating_duration_since(p.sent_at) >= ttl)
            .map(|p| p.request_id)
            .collect();
        let mut expired: Vec<_> = stale
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect();
        expired.sort_by_key(|p| p.sent_at);
        expired
    }
}

/// Fields of an inbound routing packet needed to stamp an ack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingAck {
    pub request_id: u32,
    pub from: u32,
    pub to: u32,
    pub rx_time: u32,
    pub rx_snr: f32,
    /// `proto::routing::Error` as i32.
    pub error: i32,
}

/// Stamp the stored message matching `ack.request_id`. Returns the updated
/// record, or `None` on a correlation miss.
pub fn apply_routing_ack<S: Store>(store: &mut S, ack: &RoutingAck) -> Option<MessageRecord> {
    let Some(mut message) = store.message(ack.request_id) else {
        metrics::inc_correlation_misses();
        return None;
    };
    message.ack_timestamp = Some(timestamp_or_now(ack.rx_time));
    message.ack_snr = Some(ack.rx_snr);
    message.ack_error = ack.error;
    if message.to_num.is_some() && ack.to != ack.from {
        message.real_ack = true;
    }
    if ack.error == proto::routing::Error::None as i32 {
        message.received_ack = true;
    }
    store.upsert_message(message.clone());
    metrics::inc_acks_correlated();
    Some(message)
}

/// An admin response is itself the acknowledgement of its request.
pub fn apply_admin_ack<S: Store>(store: &mut S, request_id: u32, rx_snr: f32) -> Option<MessageRecord> {
    let Some(mut message) = store.message(request_id) else {
        metrics::inc_correlation_misses();
        return None;
    };
    message.ack_timestamp = Some(Utc::now());
    message.ack_error = proto::routing::Error::None as i32;
    message.received_ack = true;
    message.real_ack = true;
    message.ack_snr = Some(rx_snr);
    store.upsert_message(message.clone());
    metrics::inc_acks_correlated();
    Some(message)
}

pub(crate) fn timestamp_or_now(secs: u32) -> chrono::DateTime<Utc> {
    if secs == 0 {
        return Utc::now();
    }
    Utc.timestamp_opt(i64::from(secs), 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Everything needed to send one admin message and track it.
#[derive(Debug, Clone)]
pub struct AdminRequest {
    pub packet: proto::MeshPacket,
    pub record: MessageRecord,
    pub intent: AdminIntent,
}

/// Wrap `admin` in a mesh packet from `from` to `to` on `channel`.
pub fn build_admin_request(
    intent: AdminIntent,
    admin: &proto::AdminMessage,
    from: u32,
    to: u32,
    channel: u32,
) -> AdminRequest {
    let id = codec::random_packet_id();
    let packet = proto::MeshPacket {
        from,
        to,
        channel,
        id,
        want_ack: true,
        priority: proto::mesh_packet::Priority::Reliable as i32,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::AdminApp as i32,
            payload: Bytes::from(prost::Message::encode_to_vec(admin)),
            want_response: true,
            ..Default::default()
        })),
        ..Default::default()
    };
    let record = MessageRecord {
        message_id: id,
        from_num: from,
        to_num: Some(to),
        channel: channel as i32,
        portnum: proto::PortNum::AdminApp as i32,
        timestamp: Utc::now(),
        read: true,
        admin: true,
        admin_description: Some(intent.description()),
        ..Default::default()
    };
    AdminRequest {
        packet,
        record,
        intent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MeshStore;

    fn stored(id: u32, to: Option<u32>) -> MessageRecord {
        MessageRecord {
            message_id: id,
            to_num: to,
            ..Default::default()
        }
    }

    #[test]
    fn routing_ack_marks_only_matching_message() {
        let mut store = MeshStore::in_memory();
        store.upsert_message(stored(100, None));
        store.upsert_message(stored(101, None));
        let ack = RoutingAck {
            request_id: 100,
            from: 7,
            to: 9,
            rx_time: 1_700_000_000,
            rx_snr: 6.5,
            error: proto::routing::Error::None as i32,
        };
        let updated = apply_routing_ack(&mut store, &ack).unwrap();
        assert!(updated.received_ack);
        // channel messages never get a real ack
        assert!(!updated.real_ack);
        assert_eq!(store.message(101).unwrap(), stored(101, None));
    }

    #[test]
    fn routing_error_is_recorded_without_receipt() {
        let mut store = MeshStore::in_memory();
        store.upsert_message(stored(5, Some(42)));
        let ack = RoutingAck {
            request_id: 5,
            from: 42,
            to: 9,
            rx_time: 0,
            rx_snr: -3.0,
            error: proto::routing::Error::MaxRetransmit as i32,
        };
        let updated = apply_routing_ack(&mut store, &ack).unwrap();
        assert!(!updated.received_ack);
        assert!(updated.real_ack);
        assert_eq!(updated.ack_error, proto::routing::Error::MaxRetransmit as i32);
    }

    #[test]
    fn miss_is_a_no_op() {
        let mut store = MeshStore::in_memory();
        let ack = RoutingAck {
            request_id: 1,
            from: 1,
            to: 2,
            rx_time: 0,
            rx_snr: 0.0,
            error: 0,
        };
        assert!(apply_routing_ack(&mut store, &ack).is_none());
        assert!(apply_admin_ack(&mut store, 1, 0.0).is_none());
        assert!(!store.has_changes());
    }

    #[test]
    fn pending_requests_expire_after_ttl() {
        let mut c = AdminCorrelator::new(Duration::from_secs(10));
        let now = Instant::now();
        c.register(PendingAdminRequest {
            request_id: 1,
            intent: AdminIntent::SaveOwner,
            to: 5,
            sent_at: now,
        });
        c.register(PendingAdminRequest {
            request_id: 2,
            intent: AdminIntent::RequestRingtone,
            to: 5,
            sent_at: now + Duration::from_secs(8),
        });
        let expired = c.expire(now + Duration::from_secs(11));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request_id, 1);
        assert!(c.is_pending(2));
        assert_eq!(c.resolve(2).unwrap().intent, AdminIntent::RequestRingtone);
        assert!(c.is_empty());
    }

    #[test]
    fn admin_request_wraps_payload() {
        let admin = proto::AdminMessage {
            payload_variant: Some(proto::admin_message::PayloadVariant::GetRingtoneRequest(true)),
            ..Default::default()
        };
        let req = build_admin_request(AdminIntent::RequestRingtone, &admin, 10, 10, 2);
        assert_eq!(req.record.message_id, req.packet.id);
        assert!(req.packet.id >= 255);
        assert!(req.record.admin);
        match req.packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(ref d)) => {
                assert_eq!(d.portnum, proto::PortNum::AdminApp as i32);
                assert!(d.want_response);
                let back: proto::AdminMessage = codec::decode_payload(&d.payload).unwrap();
                assert_eq!(back, admin);
            }
            _ => panic!("expected decoded payload"),
        }
    }
}
