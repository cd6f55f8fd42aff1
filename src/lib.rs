//! # Meshlink - Bluetooth LE link engine for Meshtastic radios
//!
//! Meshlink owns the phone side of a Meshtastic radio connection: finding and
//! connecting to a node over BLE, running the want-config handshake, decoding
//! every `FromRadio` frame into local records, correlating acknowledgements
//! and admin responses, and proxying the node's MQTT traffic to a broker.
//!
//! ## Features
//!
//! - **Connection lifecycle**: scan, connect, service/characteristic discovery,
//!   auto-reconnect to the preferred radio, pairing-failure detection.
//! - **Config handshake**: nonce-tagged want-config with stale-echo rejection,
//!   retry on timeout and a firmware version gate.
//! - **Packet dispatch**: text, position, waypoint, node info, routing, admin,
//!   telemetry, trace route, store-and-forward, paxcounter.
//! - **Admin correlation**: outbound admin requests are tracked until their
//!   response or routing ack arrives, or they expire.
//! - **Debounced persistence**: bursts of store mutations flush once.
//! - **MQTT client proxy**: optional `rumqttc` client behind `mqtt-client`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//! use meshlink::config::Config;
//! use meshlink::mqtt::RecordingMqttClient;
//! use meshlink::notify::LogNotifier;
//! use meshlink::radio::{start_link, RecordingTransport};
//! use meshlink::store::MeshStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
//!     let transport = RecordingTransport::with_responder(tx);
//!     let store = Arc::new(Mutex::new(MeshStore::in_memory()));
//!
//!     let (link, mut events, _task) = start_link(
//!         transport,
//!         rx,
//!         store,
//!         Arc::new(LogNotifier),
//!         RecordingMqttClient::new(),
//!         config.runtime_preferences(),
//!     );
//!     link.start_scan()?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`radio`] - transport surface, framing, session state and the link task
//! - [`dispatch`] - per-port handlers that turn packets into records
//! - [`correlator`] - admin request tracking and ack application
//! - [`debounce`] - coalescing scheduler for store flushes
//! - [`mqtt`] - MQTT client proxy bridge
//! - [`store`] - record types and the persistence seam
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌─────────────────┐
//! │  BLE Transport  │ ───→ │   RadioLink     │ ← single select! loop
//! └─────────────────┘      └─────────────────┘
//!                           │       │       │
//!                  ┌────────┘       │       └────────┐
//!          ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!          │  Dispatcher  │ │  Correlator  │ │  MQTT Bridge │
//!          └──────────────┘ └──────────────┘ └──────────────┘
//!                  │
//!          ┌──────────────┐
//!          │ Store + flush│
//!          └──────────────┘
//! ```

pub mod config;
pub mod correlator;
pub mod debounce;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod logutil;
pub mod metrics;
pub mod mqtt;
pub mod notify;
pub mod protobuf;
pub mod radio;
pub mod store;
