//! Radio link: BLE transport surface, wire framing, session state and the
//! connection state machine that ties them together.
pub mod codec;
pub mod firmware;
pub mod framer;
pub mod link;
pub mod session;
pub mod state;
pub mod transport;
pub mod uuids;

pub use link::{start_link, AdminCall, LinkCommand, LinkHandle, LinkStatus, OutgoingText, RadioLink};
pub use session::{ConnectionSession, Device, SessionCounters, BROADCAST_NUM, MINIMUM_NODE_NUM};
pub use state::ConnectionState;
pub use transport::{AdapterState, RecordingTransport, Transport, TransportEvent};
