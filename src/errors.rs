use thiserror::Error;

/// Failures reported by the BLE adapter. `code` is the platform error code
/// used for disconnect classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct TransportError {
    pub code: i64,
    pub message: String,
}

impl TransportError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Frame and payload decoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A FromRadio frame with no payload variant set.
    #[error("empty frame")]
    Empty,

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Errors surfaced by a [`crate::store::Store`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Flush worker failed to run (task panic or cancellation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors returned to callers of outbound link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not connected to a radio")]
    NotConnected,

    /// Outbound operations need the node number learned from my-info.
    #[error("connected node number not yet known")]
    NodeUnknown,

    #[error("no phone position available")]
    NoPosition,

    /// An admin save carried no payload variant.
    #[error("admin payload is empty")]
    EmptyPayload,

    #[error("link task has shut down")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MqttError {
    #[error("mqtt client error: {0}")]
    Client(String),

    #[error("mqtt bridge is not open")]
    NotOpen,
}
