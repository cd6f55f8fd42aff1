//! Message ingestion shared by text, reply, detection-sensor, range-test and
//! store-and-forward text packets.
use chrono::Utc;
use log::debug;
use std::time::Duration;

use super::{lock, markdown, node_or_stub, Dispatcher};
use crate::correlator::timestamp_or_now;
use crate::events::LinkEvent;
use crate::logutil::truncate_for_log;
use crate::notify::{Notification, QueueOptions};
use crate::protobuf::proto;
use crate::radio::session::{ConnectionSession, BROADCAST_NUM};
use crate::store::{KeyMatch, MessageRecord, Store, UserRecord};

/// `seq <n>`, the payload range-test senders emit.
pub(crate) fn is_range_test_payload(text: &str) -> bool {
    text.strip_prefix("seq ")
        .map(|rest| rest.chars().next().map_or(false, |c| c.is_ascii_digit()))
        .unwrap_or(false)
}

impl<S: Store> Dispatcher<S> {
    /// `store_forward` is `Some(is_broadcast)` for text replayed by a router.
    pub(super) fn ingest_text(
        &mut self,
        session: &mut ConnectionSession,
        packet: &proto::MeshPacket,
        data: &proto::Data,
        text: String,
        store_forward: Option<bool>,
    ) {
        if !self.wants_range_test() && store_forward.is_none() && is_range_test_payload(&text) {
            debug!("dropping range test payload from {}", packet.from);
            return;
        }
        if text.is_empty() {
            return;
        }
        let my_num = session.node_num();
        let detection = data.portnum == proto::PortNum::DetectionSensorApp as i32;
        let detection_muted = detection && !self.preferences().detection_sensor_notifications;
        let sf_broadcast = store_forward.unwrap_or(false);

        let Some(mut db) = lock(self.store()) else {
            return;
        };
        if db.message(packet.id).is_some() {
            debug!("duplicate message {} ignored", packet.id);
            return;
        }

        let to_num = (!sf_broadcast && packet.to != BROADCAST_NUM).then_some(packet.to);
        let mut message = MessageRecord {
            message_id: packet.id,
            from_num: packet.from,
            to_num,
            channel: packet.channel as i32,
            portnum: data.portnum,
            markdown: Some(markdown::render(&text)),
            text,
            timestamp: timestamp_or_now(packet.rx_time),
            read: detection_muted,
            is_emoji: data.emoji == 1,
            reply_id: (data.reply_id > 0).then_some(data.reply_id),
            store_forward: store_forward.is_some(),
            rx_snr: packet.rx_snr,
            rx_rssi: packet.rx_rssi,
            hop_start: packet.hop_start,
            hop_limit: packet.hop_limit,
            via_mqtt: packet.via_mqtt,
            ..Default::default()
        };

        let mut sender = node_or_stub(&*db, packet.from);
        let mut user = sender
            .user
            .take()
            .unwrap_or_else(|| UserRecord::stub(packet.from));
        if packet.pki_encrypted && !packet.public_key.is_empty() {
            let key = packet.public_key.to_vec();
            if to_num.is_some() {
                match &user.public_key {
                    Some(stored) if *stored == key => user.key_match = Some(KeyMatch::Matching),
                    Some(_) => user.key_match = Some(KeyMatch::NotMatching),
                    None => user.public_key = Some(key.clone()),
                }
            } else if user.public_key.is_none() {
                user.public_key = Some(key.clone());
            }
            user.pki_encrypted = true;
            message.pki_encrypted = true;
            message.public_key = Some(key);
        }
        if packet.rx_time > 0 {
            sender.last_heard = Some(timestamp_or_now(packet.rx_time));
        }
        if to_num.is_some() {
            user.last_message = Some(Utc::now());
        }
        let sender_muted = user.mute;
        let sender_name = Some(user.long_name.clone()).filter(|n| !n.is_empty());
        sender.user = Some(user);
        db.upsert_node(sender);

        let message_id = message.message_id;
        let channel = message.channel;
        let body = message.text.clone();
        db.upsert_message(message);
        let unread = db.unread_counts(my_num);
        let channel_record = db
            .my_info(my_num)
            .and_then(|info| info.channel(channel).cloned());
        drop(db);
        self.touch();

        debug!(
            "message {} from {}: {}",
            message_id,
            packet.from,
            truncate_for_log(&body, 80)
        );
        self.emit(LinkEvent::MessageReceived {
            message_id,
            from: packet.from,
            to: to_num,
            channel,
        });

        if detection_muted {
            return;
        }

        match to_num {
            Some(to) => {
                if to == my_num {
                    self.emit(LinkEvent::UnreadCounts(unread));
                }
                if self.preferences().direct_message_notifications && !sender_muted {
                    self.notifier().queue(
                        Notification {
                            id: format!("notification.id.user_{}", packet.from),
                            title: "New Direct Message Received".into(),
                            subtitle: sender_name.map(|n| format!("From: {}", n)),
                            body,
                            path: Some(format!(
                                "meshlink:///messages?user={}&id={}",
                                packet.from, message_id
                            )),
                        },
                        QueueOptions::default(),
                    );
                }
            }
            None => {
                let pending = unread.channels.get(&channel).copied().unwrap_or(0);
                self.emit(LinkEvent::UnreadCounts(unread));
                let Some(record) = channel_record else {
                    return;
                };
                if !self.preferences().channel_message_notifications
                    || self.displayed_channel == Some(channel)
                    || pending == 0
                    || record.is_disabled()
                    || record.mute
                {
                    return;
                }
                self.notifier().queue(
                    Notification {
                        id: format!("notification.id.channel_{}", record.index),
                        title: format!("Channel {}", record.display_name()),
                        subtitle: None,
                        body: "You have unread channel messages".into(),
                        path: Some(format!(
                            "meshlink:///messages?channel={}&id={}",
                            record.index, message_id
                        )),
                    },
                    QueueOptions {
                        delay: Some(Duration::from_secs(1)),
                        remove_existing: true,
                    },
                );
            }
        }
    }
}
