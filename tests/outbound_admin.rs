mod common;

use common::*;
use meshlink::correlator::AdminIntent;
use meshlink::errors::LinkError;
use meshlink::events::LinkEvent;
use meshlink::protobuf::proto;
use meshlink::protobuf::proto::admin_message::PayloadVariant as Admin;
use meshlink::radio::codec;
use meshlink::radio::{OutgoingText, BROADCAST_NUM};
use meshlink::store::{ConfigSection, Store};
use std::time::Duration;

fn admin_of(packet: &proto::MeshPacket) -> proto::AdminMessage {
    match &packet.payload_variant {
        Some(proto::mesh_packet::PayloadVariant::Decoded(d)) => {
            assert_eq!(d.portnum, proto::PortNum::AdminApp as i32);
            codec::decode_payload(&d.payload).unwrap()
        }
        other => panic!("not a decoded packet: {:?}", other),
    }
}

#[tokio::test]
async fn outbound_needs_a_connected_node() {
    let fx = start(fast_prefs());
    let err = fx
        .handle
        .send_message(OutgoingText {
            text: "hello".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
    assert!(matches!(
        fx.handle.request_ringtone().await,
        Err(LinkError::NotConnected)
    ));
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn send_message_normalizes_quotes_and_persists() {
    let mut fx = start(fast_prefs());
    fx.connect_and_subscribe().await;

    let id = fx
        .handle
        .send_message(OutgoingText {
            text: "it’s “fine”".into(),
            to: Some(0x42),
            channel: 0,
            ..Default::default()
        })
        .await
        .unwrap();

    let sent = fx.sent_packets();
    let packet = sent.iter().find(|p| p.id == id).expect("packet written");
    assert_eq!(packet.from, MY_NUM);
    assert_eq!(packet.to, 0x42);
    assert!(packet.want_ack);
    let Some(proto::mesh_packet::PayloadVariant::Decoded(data)) = &packet.payload_variant else {
        panic!("payload not decoded");
    };
    assert_eq!(&data.payload[..], "it's \"fine\"".as_bytes());

    let msg = fx.store.lock().unwrap().message(id).unwrap();
    assert_eq!(msg.text, "it's \"fine\"");
    assert_eq!(msg.from_num, MY_NUM);
    assert_eq!(msg.to_num, Some(0x42));
    assert!(!msg.received_ack);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn routing_ack_marks_message_delivered() {
    let mut fx = start(fast_prefs());
    fx.connect_and_subscribe().await;
    let id = fx
        .handle
        .send_message(OutgoingText {
            text: "ping".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(fx.sent_packets()[0].to, BROADCAST_NUM);

    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(
            proto::routing::Error::None as i32,
        )),
    };
    fx.deliver(vec![mesh_frame_with(
        0x42,
        MY_NUM,
        9001,
        proto::PortNum::RoutingApp,
        prost::Message::encode_to_vec(&routing),
        id,
    )]);
    let seen = fx
        .wait_for(|e| matches!(e, LinkEvent::MessageAcked { message_id, .. } if *message_id == id))
        .await;
    // a relayed ack for a broadcast is implicit, never a real ack
    assert!(matches!(
        seen.last(),
        Some(LinkEvent::MessageAcked { received: true, real_ack: false, .. })
    ));
    assert!(fx.store.lock().unwrap().message(id).unwrap().received_ack);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn admin_request_is_correlated_with_its_response() {
    let mut fx = start(fast_prefs());
    fx.connect_and_subscribe().await;

    let request_id = fx.handle.request_ringtone().await.unwrap();
    let sent = fx.sent_packets();
    let packet = sent.iter().find(|p| p.id == request_id).unwrap();
    assert_eq!(packet.to, MY_NUM);
    assert!(matches!(
        admin_of(packet).payload_variant,
        Some(Admin::GetRingtoneRequest(true))
    ));
    assert_eq!(fx.handle.status().await.unwrap().pending_admin, 1);

    fx.deliver(vec![admin_frame(
        MY_NUM,
        request_id,
        Admin::GetRingtoneResponse("24:d=32,o=5,b=565:f6".into()),
    )]);
    let seen = fx
        .wait_for(|e| matches!(e, LinkEvent::AdminRequestResolved { .. }))
        .await;
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::AdminRequestResolved {
            request_id,
            intent: AdminIntent::RequestRingtone,
        })
    );
    assert!(seen.contains(&LinkEvent::RingtoneReceived("24:d=32,o=5,b=565:f6".into())));
    assert_eq!(fx.handle.status().await.unwrap().pending_admin, 0);
    assert_eq!(
        fx.store
            .lock()
            .unwrap()
            .node_config(MY_NUM)
            .unwrap()
            .ringtone
            .as_deref(),
        Some("24:d=32,o=5,b=565:f6")
    );
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn unanswered_admin_request_expires() {
    let mut prefs = fast_prefs();
    prefs.admin_pending_ttl = Duration::from_millis(20);
    let mut fx = start(prefs);
    fx.connect_and_subscribe().await;

    let request_id = fx.handle.request_channel(1).await.unwrap();
    let sent = fx.sent_packets();
    let packet = sent.iter().find(|p| p.id == request_id).unwrap();
    // channel requests are 1-based on the wire
    assert!(matches!(
        admin_of(packet).payload_variant,
        Some(Admin::GetChannelRequest(2))
    ));

    let seen = fx
        .wait_for(|e| matches!(e, LinkEvent::AdminRequestExpired { .. }))
        .await;
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::AdminRequestExpired {
            request_id,
            intent: AdminIntent::RequestChannel(1),
        })
    );
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn saved_config_is_applied_locally() {
    let mut fx = start(fast_prefs());
    fx.connect_and_subscribe().await;
    let request_id = fx
        .handle
        .save_config(proto::Config {
            payload_variant: Some(proto::config::PayloadVariant::Lora(proto::config::LoRaConfig {
                hop_limit: 6,
                ..Default::default()
            })),
        })
        .await
        .unwrap();
    assert!(fx.store.lock().unwrap().message(request_id).unwrap().admin);
    assert_eq!(
        fx.store
            .lock()
            .unwrap()
            .node_config(MY_NUM)
            .unwrap()
            .lora()
            .unwrap()
            .hop_limit,
        6
    );

    let err = fx
        .handle
        .save_config(proto::Config::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::EmptyPayload));

    // the routing ack for a save resolves it too
    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(
            proto::routing::Error::None as i32,
        )),
    };
    fx.deliver(vec![mesh_frame_with(
        MY_NUM,
        MY_NUM,
        9100,
        proto::PortNum::RoutingApp,
        prost::Message::encode_to_vec(&routing),
        request_id,
    )]);
    let seen = fx
        .wait_for(|e| matches!(e, LinkEvent::AdminRequestResolved { .. }))
        .await;
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::AdminRequestResolved {
            request_id,
            intent: AdminIntent::SaveConfig(ConfigSection::Lora),
        })
    );
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn trace_route_request_is_recorded() {
    let mut fx = start(fast_prefs());
    fx.connect_and_subscribe().await;
    let id = fx.handle.send_trace_route(0x42).await.unwrap();
    let sent = fx.sent_packets();
    let packet = sent.iter().find(|p| p.id == id).unwrap();
    assert_eq!(packet.to, 0x42);
    let Some(proto::mesh_packet::PayloadVariant::Decoded(data)) = &packet.payload_variant else {
        panic!("payload not decoded");
    };
    assert_eq!(data.portnum, proto::PortNum::TracerouteApp as i32);
    assert!(data.want_response);

    let record = fx.store.lock().unwrap().trace_route(id).unwrap();
    assert_eq!(record.to_num, 0x42);
    assert!(record.sent.is_some());
    assert!(!record.response);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn position_needs_a_phone_fix() {
    let mut fx = start(fast_prefs());
    fx.connect_and_subscribe().await;
    assert!(matches!(
        fx.handle.send_position(0, None, false).await,
        Err(LinkError::NoPosition)
    ));
    fx.handle
        .set_phone_position(proto::Position {
            latitude_i: Some(475_000_000),
            longitude_i: Some(85_000_000),
            ..Default::default()
        })
        .unwrap();
    let id = fx.handle.send_position(0, None, true).await.unwrap();
    let sent = fx.sent_packets();
    let packet = sent.iter().find(|p| p.id == id).unwrap();
    assert_eq!(packet.to, BROADCAST_NUM);
    let Some(proto::mesh_packet::PayloadVariant::Decoded(data)) = &packet.payload_variant else {
        panic!("payload not decoded");
    };
    let position: proto::Position = codec::decode_payload(&data.payload).unwrap();
    assert_eq!(position.latitude_i, Some(475_000_000));
    assert!(position.time > 0);
    fx.handle.shutdown().await;
}
