//! mbg-core: Shared protocol library for the MBG border gateway.
//!
//! Provides the JSON control-plane messages exchanged between gateways, the
//! length-prefixed CBOR framing used on the mTLS data plane, connection
//! identifiers, and the gateway error type.

pub mod codec;
pub mod connection;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, frame_len, MAX_FRAME_LEN};
pub use connection::{unique_suffix, ConnectionId, PortAssignment};
pub use error::{MbgError, MbgResult};
pub use messages::{ConnectReply, ConnectRequest, ConnectStatus, Dataplane};
