mod common;

use bytes::Bytes;
use common::*;
use meshlink::events::LinkEvent;
use meshlink::mqtt::{MqttCall, MqttEvent};
use meshlink::protobuf::proto;
use meshlink::protobuf::proto::from_radio::PayloadVariant as FRPayload;
use std::time::Duration;

fn proxy_module() -> Bytes {
    frame(FRPayload::ModuleConfig(proto::ModuleConfig {
        payload_variant: Some(proto::module_config::PayloadVariant::Mqtt(
            proto::module_config::MqttConfig {
                enabled: true,
                proxy_to_client_enabled: true,
                address: "broker.local".into(),
                root: "msh".into(),
                ..Default::default()
            },
        )),
    }))
}

fn proxy_frames() -> Vec<Bytes> {
    let mut frames = bootstrap_frames(MY_NUM, 1);
    let complete = frames.pop().unwrap();
    frames.push(frame(FRPayload::Metadata(proto::DeviceMetadata {
        firmware_version: "2.5.6.d55c08d".into(),
        ..Default::default()
    })));
    frames.push(proxy_module());
    frames.push(complete);
    frames
}

fn uplink(topic: &str, payload: &'static [u8]) -> Bytes {
    frame(FRPayload::MqttClientProxyMessage(proto::MqttClientProxyMessage {
        topic: topic.into(),
        retained: false,
        payload_variant: Some(proto::mqtt_client_proxy_message::PayloadVariant::Data(
            Bytes::from_static(payload),
        )),
    }))
}

#[tokio::test]
async fn proxy_opens_after_handshake_and_bridges_both_ways() {
    let mut fx = start(fast_prefs());
    for f in proxy_frames() {
        fx.transport.queue_from_radio(f);
    }
    fx.connect();
    let seen = fx.wait_for(|e| *e == LinkEvent::MqttConnected).await;
    assert_eq!(seen.last(), Some(&LinkEvent::MqttConnected));

    let calls = fx.mqtt.calls();
    let MqttCall::Connect(settings) = &calls[0] else {
        panic!("first call should connect: {:?}", calls);
    };
    assert_eq!(settings.host, "broker.local");
    assert_eq!(settings.topic, "msh/2/e/#");
    assert!(calls.contains(&MqttCall::Subscribe("msh/2/e/#".into())));
    assert!(fx.handle.status().await.unwrap().mqtt_open);

    // radio -> broker, stat topics filtered
    fx.deliver(vec![
        uplink("msh/2/stat/!0badcafe", b"online"),
        uplink("msh/2/e/LongFast/!0badcafe", b"\x01\x02"),
    ]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let published = fx.mqtt.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "msh/2/e/LongFast/!0badcafe");
    assert_eq!(&published[0].1[..], b"\x01\x02");

    // broker -> radio
    let writes_before = fx.to_radio().len();
    assert!(fx.mqtt.inject(MqttEvent::Message {
        topic: "msh/2/e/LongFast/!1234abcd".into(),
        payload: Bytes::from_static(b"\x09"),
        retained: false,
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let writes = fx.to_radio();
    assert_eq!(writes.len(), writes_before + 1);
    match writes.last() {
        Some(proto::to_radio::PayloadVariant::MqttClientProxyMessage(m)) => {
            assert_eq!(m.topic, "msh/2/e/LongFast/!1234abcd");
        }
        other => panic!("expected proxy message, got {:?}", other),
    }
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_closes_the_proxy() {
    let mut fx = start(fast_prefs());
    for f in proxy_frames() {
        fx.transport.queue_from_radio(f);
    }
    fx.connect();
    fx.wait_for(|e| *e == LinkEvent::MqttConnected).await;

    fx.handle.disconnect(false).unwrap();
    let seen = fx.wait_for(|e| *e == LinkEvent::MqttDisconnected).await;
    assert_eq!(seen.last(), Some(&LinkEvent::MqttDisconnected));
    assert_eq!(fx.mqtt.calls().last(), Some(&MqttCall::Disconnect));
    assert!(!fx.handle.status().await.unwrap().mqtt_open);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn broker_refusal_is_reported() {
    let mut fx = start(fast_prefs());
    for f in proxy_frames() {
        fx.transport.queue_from_radio(f);
    }
    fx.connect();
    fx.wait_for(|e| *e == LinkEvent::MqttConnected).await;

    assert!(fx
        .mqtt
        .inject(MqttEvent::ConnectRefused("Invalid Credentials".into())));
    let seen = fx
        .wait_for(|e| matches!(e, LinkEvent::MqttError(_)))
        .await;
    assert_eq!(
        seen.last(),
        Some(&LinkEvent::MqttError("Invalid Credentials".into()))
    );
    assert!(!fx.handle.status().await.unwrap().mqtt_open);
    fx.handle.shutdown().await;
}

#[tokio::test]
async fn late_broker_events_do_not_reopen_a_closed_proxy() {
    let mut fx = start(fast_prefs());
    for f in proxy_frames() {
        fx.transport.queue_from_radio(f);
    }
    fx.connect();
    fx.wait_for(|e| *e == LinkEvent::MqttConnected).await;
    let stale = fx.mqtt.sender().expect("session open");

    fx.handle.disconnect(false).unwrap();
    fx.wait_for(|e| *e == LinkEvent::MqttDisconnected).await;
    let writes_before = fx.to_radio().len();

    // a connack and a message the old broker session had queued
    stale.send(MqttEvent::Connected);
    stale.send(MqttEvent::Message {
        topic: "msh/2/e/LongFast/!1234abcd".into(),
        payload: Bytes::from_static(b"\x09"),
        retained: false,
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut late = Vec::new();
    while let Ok(event) = fx.events.try_recv() {
        late.push(event);
    }
    assert!(!late.contains(&LinkEvent::MqttConnected), "{:?}", late);
    assert_eq!(fx.to_radio().len(), writes_before);
    assert!(!fx.handle.status().await.unwrap().mqtt_open);
    fx.handle.shutdown().await;
}
