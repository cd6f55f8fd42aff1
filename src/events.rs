//! Typed events emitted towards the UI / host.
use crate::correlator::AdminIntent;
use crate::radio::session::Device;
use crate::radio::state::ConnectionState;
use crate::store::{ConfigSection, MetricsType, UnreadCounts};

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    /// Discovered peripherals, in sighting order.
    DevicesChanged(Vec<Device>),
    DeviceConnected(Device),
    DeviceDisconnected {
        peripheral: String,
        reason: Option<String>,
    },
    /// Preference lists changed; the host should persist them.
    PreferencesChanged {
        peripherals: Vec<String>,
        nodes: Vec<u32>,
    },
    ConnectionError(String),

    MyInfoReceived(u32),
    NodeInfoReceived(u32),
    ChannelReceived(i32),
    ConfigReceived {
        node: u32,
        section: ConfigSection,
    },
    MetadataReceived {
        node: u32,
        firmware_version: String,
        supported: bool,
    },
    CannedMessagesReceived(String),
    RingtoneReceived(String),
    Rebooted,
    WantConfigFinished {
        nonce: u32,
    },

    MessageReceived {
        message_id: u32,
        from: u32,
        to: Option<u32>,
        channel: i32,
    },
    MessageAcked {
        message_id: u32,
        received: bool,
        real_ack: bool,
        error: i32,
        /// Direct recipient; `None` means the channel's state was touched.
        to: Option<u32>,
        channel: i32,
    },
    UnreadCounts(UnreadCounts),
    PositionReceived(u32),
    WaypointReceived {
        id: u32,
        first_sighting: bool,
    },
    TelemetryReceived {
        node: u32,
        metrics: MetricsType,
    },
    TraceRouteReceived {
        request_id: u32,
        route: String,
    },
    StoreForwardUpdated(u32),
    PaxReceived(u32),

    AdminRequestResolved {
        request_id: u32,
        intent: AdminIntent,
    },
    AdminRequestExpired {
        request_id: u32,
        intent: AdminIntent,
    },

    MqttConnected,
    MqttDisconnected,
    MqttError(String),
}
