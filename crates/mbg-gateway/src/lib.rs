//! mbg-gateway: MBG border gateway.
//!
//! Exposes local services to peer gateways and imports remote services as
//! local proxy endpoints. A connection request is admitted by the policy
//! gate, negotiated with the peer gateway over the HTTP control plane, and
//! carried by a plain TCP or mutual-TLS forwarder.
//!
//! # Data Flow
//!
//! ```text
//! POST/GET /connect (server.rs)          local client → imported-service listener
//!   → ConnectionRouter::handle_connect       → ConnectionRouter::forward_imported
//!       → AdmissionGate::authorize               → AdmissionGate::authorize
//!       → PortTracker::allocate / track          → PeerClient::request_connect[_upgrade]
//!       → PeerClient (remote destinations)       → TcpForwarder / MtlsForwarder
//!       → spawn TcpForwarder / receiver
//! ```

pub mod certs;
pub mod config;
pub mod dataplane;
pub mod handshake;
pub mod listener;
pub mod policy;
pub mod router;
pub mod server;
pub mod state;

pub use config::GatewayConfig;
pub use router::ConnectionRouter;
pub use server::GatewayServer;
pub use state::{GatewayState, PortTracker};
