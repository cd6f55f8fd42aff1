//! Admin responses from local or remote nodes.
use log::{debug, info};

use super::bootstrap::merge_user;
use super::{lock, node_or_stub, Dispatcher};
use crate::correlator::apply_admin_ack;
use crate::events::LinkEvent;
use crate::protobuf::proto;
use crate::protobuf::proto::admin_message::PayloadVariant as Admin;
use crate::radio::codec;
use crate::store::Store;

impl<S: Store> Dispatcher<S> {
    /// Apply the response to the sender's records, then treat it as the
    /// acknowledgement of `data.request_id`. Returns that id on a match.
    pub(super) fn admin(&mut self, packet: &proto::MeshPacket, data: &proto::Data) -> Option<u32> {
        let admin: proto::AdminMessage = match codec::decode_payload(&data.payload) {
            Ok(a) => a,
            Err(e) => {
                debug!("bad admin payload from {}: {}", packet.from, e);
                return None;
            }
        };
        match admin.payload_variant {
            Some(Admin::GetCannedMessageModuleMessagesResponse(messages)) => {
                if self.update_node_config(packet.from, |c| c.canned_messages = Some(messages.clone())) {
                    self.emit(LinkEvent::CannedMessagesReceived(messages));
                }
            }
            Some(Admin::GetRingtoneResponse(ringtone)) => {
                if self.update_node_config(packet.from, |c| c.ringtone = Some(ringtone.clone())) {
                    self.emit(LinkEvent::RingtoneReceived(ringtone));
                }
            }
            Some(Admin::GetChannelResponse(channel)) => self.channel(&channel, packet.from),
            Some(Admin::GetDeviceMetadataResponse(metadata)) => self.metadata(packet.from, &metadata),
            Some(Admin::GetConfigResponse(config)) => self.config(packet.from, &config),
            Some(Admin::GetModuleConfigResponse(config)) => self.module_config(packet.from, &config),
            Some(Admin::GetOwnerResponse(user)) => {
                if let Some(mut db) = lock(self.store()) {
                    let mut node = node_or_stub(&*db, packet.from);
                    node.user = Some(merge_user(packet.from, &user, node.user.take()));
                    db.upsert_node(node);
                    drop(db);
                    self.touch();
                    self.emit(LinkEvent::NodeInfoReceived(packet.from));
                }
            }
            Some(other) => debug!("admin message {:?} from {} not handled", other, packet.from),
            None => {}
        }

        let mut db = lock(self.store())?;
        let acked = apply_admin_ack(&mut *db, data.request_id, packet.rx_snr)?;
        drop(db);
        self.touch();
        info!(
            "admin request {} answered by {}",
            data.request_id, packet.from
        );
        self.emit(LinkEvent::MessageAcked {
            message_id: acked.message_id,
            received: acked.received_ack,
            real_ack: acked.real_ack,
            error: acked.ack_error,
            to: acked.to_num,
            channel: acked.channel,
        });
        Some(data.request_id)
    }

    /// Edit the config record of an already-known node.
    fn update_node_config(
        &mut self,
        num: u32,
        edit: impl FnOnce(&mut crate::store::NodeConfigRecord),
    ) -> bool {
        let Some(mut db) = lock(self.store()) else {
            return false;
        };
        if db.node(num).is_none() {
            debug!("admin response from unknown node {}", num);
            return false;
        }
        let mut config = db.node_config(num).unwrap_or_default();
        edit(&mut config);
        db.upsert_node_config(num, config);
        drop(db);
        self.touch();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::super::Effect;
    use super::*;
    use crate::config::RuntimePreferences;
    use crate::store::{ConfigSection, MessageRecord, NodeRecord};
    use prost::Message;

    fn admin_packet(from: u32, request_id: u32, admin: proto::AdminMessage) -> codec::InboundPacket {
        let mut packet = mesh(from, 10, 4242, proto::PortNum::AdminApp, admin.encode_to_vec());
        if let proto::from_radio::PayloadVariant::Packet(p) = &mut packet {
            if let Some(proto::mesh_packet::PayloadVariant::Decoded(d)) = &mut p.payload_variant {
                d.request_id = request_id;
            }
        }
        packet
    }

    #[tokio::test]
    async fn canned_messages_response_acks_request() {
        let mut h = Harness::new(RuntimePreferences::default());
        {
            let mut db = h.store.lock().unwrap();
            db.upsert_node(NodeRecord::new(42));
            db.upsert_message(MessageRecord {
                message_id: 55,
                from_num: 10,
                to_num: Some(42),
                admin: true,
                ..Default::default()
            });
        }
        let effects = h.dispatch(admin_packet(
            42,
            55,
            proto::AdminMessage {
                payload_variant: Some(Admin::GetCannedMessageModuleMessagesResponse(
                    "yes|no|omw".into(),
                )),
                ..Default::default()
            },
        ));
        assert_eq!(effects, vec![Effect::RequestAnswered(55)]);
        let db = h.store.lock().unwrap();
        assert_eq!(
            db.node_config(42).unwrap().canned_messages.as_deref(),
            Some("yes|no|omw")
        );
        let msg = db.message(55).unwrap();
        assert!(msg.received_ack && msg.real_ack);
        assert_eq!(msg.ack_snr, Some(5.5));
    }

    #[tokio::test]
    async fn remote_config_lands_on_sender() {
        let mut h = Harness::new(RuntimePreferences::default());
        h.dispatch(admin_packet(
            42,
            0,
            proto::AdminMessage {
                payload_variant: Some(Admin::GetConfigResponse(proto::Config {
                    payload_variant: Some(proto::config::PayloadVariant::Lora(
                        proto::config::LoRaConfig {
                            hop_limit: 5,
                            ..Default::default()
                        },
                    )),
                })),
                ..Default::default()
            },
        ));
        let db = h.store.lock().unwrap();
        assert_eq!(db.node_config(42).unwrap().lora().unwrap().hop_limit, 5);
        assert!(db.node_config(10).is_none());
        drop(db);
        assert!(h.drain_events().contains(&LinkEvent::ConfigReceived {
            node: 42,
            section: ConfigSection::Lora,
        }));
    }

    #[tokio::test]
    async fn unmatched_response_answers_nothing() {
        let mut h = Harness::new(RuntimePreferences::default());
        let effects = h.dispatch(admin_packet(
            42,
            999,
            proto::AdminMessage {
                payload_variant: Some(Admin::GetRingtoneResponse("beep".into())),
                ..Default::default()
            },
        ));
        assert!(effects.is_empty());
        // ringtone needs a known node
        assert!(h.store.lock().unwrap().node_config(42).is_none());
    }
}
