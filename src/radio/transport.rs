//! BLE adapter capability surface.
//!
//! Adapter calls are fire-and-forget; results come back as
//! [`TransportEvent`]s on a channel that the link loop drains in order.
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::TransportError;
use crate::radio::uuids;

/// Platform peripheral identifier (stable per OS pairing).
pub type PeripheralId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    PoweredOff,
    PoweredOn,
    Unauthorized,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(AdapterState),
    Discovered {
        peripheral: PeripheralId,
        name: Option<String>,
        rssi: i32,
    },
    Connected {
        peripheral: PeripheralId,
    },
    FailedToConnect {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<Uuid>,
        error: Option<TransportError>,
    },
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
        error: Option<TransportError>,
    },
    ValueUpdated {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Option<Bytes>,
        error: Option<TransportError>,
    },
}

impl TransportEvent {
    /// Peripheral the event refers to; `None` for adapter-wide events.
    pub fn peripheral(&self) -> Option<&str> {
        match self {
            TransportEvent::StateChanged(_) => None,
            TransportEvent::Discovered { peripheral, .. }
            | TransportEvent::Connected { peripheral }
            | TransportEvent::FailedToConnect { peripheral, .. }
            | TransportEvent::Disconnected { peripheral, .. }
            | TransportEvent::ServicesDiscovered { peripheral, .. }
            | TransportEvent::CharacteristicsDiscovered { peripheral, .. }
            | TransportEvent::ValueUpdated { peripheral, .. } => Some(peripheral),
        }
    }
}

pub trait Transport: Send {
    fn is_scanning(&self) -> bool;
    fn scan(&mut self, service: Uuid);
    fn stop_scan(&mut self);
    fn connect(&mut self, peripheral: &str);
    /// Cancel a pending or established connection.
    fn disconnect(&mut self, peripheral: &str);
    fn discover_services(&mut self, peripheral: &str, services: &[Uuid]);
    fn discover_characteristics(&mut self, peripheral: &str, characteristics: &[Uuid], service: Uuid);
    fn set_notify(&mut self, peripheral: &str, characteristic: Uuid, enabled: bool);
    fn read_value(&mut self, peripheral: &str, characteristic: Uuid);
    /// Errors here are local (no such peripheral); remote failures arrive as events.
    fn write_value(
        &mut self,
        peripheral: &str,
        characteristic: Uuid,
        data: Bytes,
        with_response: bool,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Scan(Uuid),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId, Vec<Uuid>),
    DiscoverCharacteristics(PeripheralId, Vec<Uuid>, Uuid),
    SetNotify(PeripheralId, Uuid, bool),
    Read(PeripheralId, Uuid),
    Write {
        peripheral: PeripheralId,
        characteristic: Uuid,
        data: Bytes,
        with_response: bool,
    },
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<TransportCall>,
    from_radio: VecDeque<Bytes>,
    scanning: bool,
}

/// Transport double that records every call.
///
/// With a responder attached it also behaves like a well-formed Meshtastic
/// peripheral: connects succeed, discovery reports the Meshtastic service
/// and characteristics, and reads of from-radio pop queued frames (an empty
/// value once drained). Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
    responder: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            inner: Arc::default(),
            responder: Some(events),
        }
    }

    /// Frame returned by a later read of from-radio.
    pub fn queue_from_radio(&self, frame: Bytes) {
        if let Ok(mut g) = self.inner.lock() {
            g.from_radio.push_back(frame);
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.lock().map(|g| g.calls.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.calls.clear();
        }
    }

    /// Payloads written to `characteristic`, in order.
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Bytes> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::Write {
                    characteristic: ch,
                    data,
                    ..
                } if ch == characteristic => Some(data),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: TransportCall) {
        if let Ok(mut g) = self.inner.lock() {
            g.calls.push(call);
        }
    }

    fn respond(&self, event: TransportEvent) {
        if let Some(tx) = &self.responder {
            let _ = tx.send(event);
        }
    }
}

impl Transport for RecordingTransport {
    fn is_scanning(&self) -> bool {
        self.inner.lock().map(|g| g.scanning).unwrap_or(false)
    }

    fn scan(&mut self, service: Uuid) {
        if let Ok(mut g) = self.inner.lock() {
            g.scanning = true;
        }
        self.record(TransportCall::Scan(service));
    }

    fn stop_scan(&mut self) {
        if let Ok(mut g) = self.inner.lock() {
            g.scanning = false;
        }
        self.record(TransportCall::StopScan);
    }

    fn connect(&mut self, peripheral: &str) {
        self.record(TransportCall::Connect(peripheral.to_string()));
        self.respond(TransportEvent::Connected {
            peripheral: peripheral.to_string(),
        });
    }

    fn disconnect(&mut self, peripheral: &str) {
        self.record(TransportCall::Disconnect(peripheral.to_string()));
        self.respond(TransportEvent::Disconnected {
            peripheral: peripheral.to_string(),
            error: None,
        });
    }

    fn discover_services(&mut self, peripheral: &str, services: &[Uuid]) {
        self.record(TransportCall::DiscoverServices(
            peripheral.to_string(),
            services.to_vec(),
        ));
        self.respond(TransportEvent::ServicesDiscovered {
            peripheral: peripheral.to_string(),
            services: vec![uuids::MESHTASTIC_SERVICE],
            error: None,
        });
    }

    fn discover_characteristics(&mut self, peripheral: &str, characteristics: &[Uuid], service: Uuid) {
        self.record(TransportCall::DiscoverCharacteristics(
            peripheral.to_string(),
            characteristics.to_vec(),
            service,
        ));
        self.respond(TransportEvent::CharacteristicsDiscovered {
            peripheral: peripheral.to_string(),
            service,
            characteristics: characteristics.to_vec(),
            error: None,
        });
    }

    fn set_notify(&mut self, peripheral: &str, characteristic: Uuid, enabled: bool) {
        self.record(TransportCall::SetNotify(
            peripheral.to_string(),
            characteristic,
            enabled,
        ));
    }

    fn read_value(&mut self, peripheral: &str, characteristic: Uuid) {
        self.record(TransportCall::Read(peripheral.to_string(), characteristic));
        if characteristic == uuids::FROM_RADIO && self.responder.is_some() {
            let next = self
                .inner
                .lock()
                .ok()
                .and_then(|mut g| g.from_radio.pop_front())
                .unwrap_or_default();
            self.respond(TransportEvent::ValueUpdated {
                peripheral: peripheral.to_string(),
                characteristic,
                value: Some(next),
                error: None,
            });
        }
    }

    fn write_value(
        &mut self,
        peripheral: &str,
        characteristic: Uuid,
        data: Bytes,
        with_response: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Write {
            peripheral: peripheral.to_string(),
            characteristic,
            data,
            with_response,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_writes() {
        let mut t = RecordingTransport::new();
        let shared = t.clone();
        t.scan(uuids::MESHTASTIC_SERVICE);
        assert!(shared.is_scanning());
        t.write_value("p1", uuids::TO_RADIO, Bytes::from_static(b"\x18\x01"), true)
            .unwrap();
        assert_eq!(shared.writes_to(uuids::TO_RADIO).len(), 1);
        assert_eq!(shared.calls().len(), 2);
    }

    #[tokio::test]
    async fn responder_drains_from_radio_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = RecordingTransport::with_responder(tx);
        t.queue_from_radio(Bytes::from_static(b"abc"));
        t.read_value("p1", uuids::FROM_RADIO);
        t.read_value("p1", uuids::FROM_RADIO);
        match rx.recv().await {
            Some(TransportEvent::ValueUpdated { value, .. }) => {
                assert_eq!(value.unwrap(), Bytes::from_static(b"abc"))
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await {
            Some(TransportEvent::ValueUpdated { value, .. }) => assert!(value.unwrap().is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
