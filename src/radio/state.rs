//! Connection states and disconnect classification.
use std::fmt;

use crate::errors::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    HandshakePending,
    Subscribed,
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
                | ConnectionState::HandshakePending
                | ConnectionState::Subscribed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::DiscoveringServices => write!(f, "discovering services"),
            ConnectionState::DiscoveringCharacteristics => write!(f, "discovering characteristics"),
            ConnectionState::HandshakePending => write!(f, "handshake pending"),
            ConnectionState::Subscribed => write!(f, "subscribed"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
        }
    }
}

pub const CONNECT_TIMEOUT_TEXT: &str = "Bluetooth connection timed out";
pub const CONNECT_ERROR_TEXT: &str = "Bluetooth connection error, please try again.";
pub const AUTH_FAILURE_TEXT: &str = "Bluetooth authentication or encryption is insufficient. Please check connecting again and pay attention to the PIN code.";
pub const HANDSHAKE_TIMEOUT_TEXT: &str = "Configuration handshake timed out";

/// User-facing reason for a lost or failed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectClassification {
    pub message: String,
    /// Queue a "Radio Disconnected" notification if this is the preferred radio.
    pub notify_if_preferred: bool,
}

pub fn classify_disconnect(error: &TransportError) -> DisconnectClassification {
    match error.code {
        6 => DisconnectClassification {
            message: "Connection timed out. Will connect back soon.".into(),
            notify_if_preferred: false,
        },
        7 => DisconnectClassification {
            message: "Node was disconnected. Check if it's turned on.".into(),
            notify_if_preferred: true,
        },
        14 => DisconnectClassification {
            message: "Pairing was cancelled. Please try to pair the node again.".into(),
            notify_if_preferred: false,
        },
        _ => DisconnectClassification {
            message: error.message.clone(),
            notify_if_preferred: true,
        },
    }
}

/// Characteristic errors that mean pairing failed (insufficient authentication / encryption).
pub fn is_auth_failure(error: &TransportError) -> bool {
    matches!(error.code, 5 | 15)
}
