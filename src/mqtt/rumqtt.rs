//! [`MqttClient`] backed by `rumqttc`. The event loop runs on its own task
//! and reports through the bridge's event channel.
use bytes::Bytes;
use log::{debug, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, LastWill, MqttOptions, Packet, QoS,
    Transport,
};
use tokio::task::JoinHandle;

use super::{MqttClient, MqttEvent, MqttEventSender, MqttSettings};
use crate::errors::MqttError;

const WILL_TOPIC: &str = "/will";
const WILL_PAYLOAD: &str = "dieout";

pub fn connack_text(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "Accepted",
        ConnectReturnCode::RefusedProtocolVersion => "Unacceptable Protocol version",
        ConnectReturnCode::BadClientId => "Invalid Id",
        ConnectReturnCode::ServiceUnavailable => "Invalid Server",
        ConnectReturnCode::BadUserNamePassword => "Invalid Credentials",
        ConnectReturnCode::NotAuthorized => "Authorization Error",
    }
}

#[derive(Default)]
pub struct RumqttClient {
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
}

impl RumqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(settings: &MqttSettings) -> MqttOptions {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(settings.keep_alive);
        opts.set_clean_session(false);
        opts.set_last_will(LastWill::new(WILL_TOPIC, WILL_PAYLOAD, QoS::AtMostOnce, false));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            opts.set_credentials(user, pass);
        } else if let Some(user) = &settings.username {
            opts.set_credentials(user, "");
        }
        if settings.tls {
            opts.set_transport(Transport::tls_with_default_config());
        }
        opts
    }
}

impl MqttClient for RumqttClient {
    fn connect(&mut self, settings: &MqttSettings, events: MqttEventSender) -> Result<(), MqttError> {
        self.disconnect();
        let (client, mut eventloop) = AsyncClient::new(Self::options(settings), 32);
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        let event = if ack.code == ConnectReturnCode::Success {
                            MqttEvent::Connected
                        } else {
                            MqttEvent::ConnectRefused(connack_text(ack.code).to_string())
                        };
                        if !events.send(event) {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let message = MqttEvent::Message {
                            topic: p.topic,
                            payload: p.payload,
                            retained: p.retain,
                        };
                        if !events.send(message) {
                            break;
                        }
                    }
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        let _ = events.send(MqttEvent::Disconnected(None));
                        break;
                    }
                    Ok(other) => debug!("mqtt event: {:?}", other),
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        let _ = events.send(MqttEvent::ConnectRefused(connack_text(code).to_string()));
                        break;
                    }
                    Err(e) => {
                        warn!("mqtt connection error: {}", e);
                        let _ = events.send(MqttEvent::Disconnected(Some(e.to_string())));
                        break;
                    }
                }
            }
        });
        self.client = Some(client);
        self.task = Some(task);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::NotOpen)?;
        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| MqttError::Client(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::NotOpen)?;
        client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|e| MqttError::Client(e.to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("mqtt disconnect: {}", e);
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
