//! Control-plane and data-plane messages exchanged between gateways.
//!
//! Control-plane bodies are JSON with the camelCase field names peers
//! already speak (`idDest`, `mbgId`, `connectType`, ...). The data-plane
//! preamble ([`EndpointHello`] / [`EndpointAck`]) is CBOR, see [`crate::codec`].

use crate::error::MbgError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Control-plane path for connection requests.
pub const CONNECT_PATH: &str = "/connect";

/// `Upgrade` token used by the hijack variant of `/connect`.
pub const CONNECT_UPGRADE: &str = "mbg-connect";

/// Target sentinel telling the requester to keep using the upgraded socket.
pub const USE_CONNECT_MODE: &str = "use connect mode";

/// Reply message for a successful connect.
pub const MSG_SUCCESS: &str = "Success";

/// Reply message for a connection that is already active.
pub const MSG_ALREADY_SETUP: &str = "Connection already setup!";

/// Reply message for a refused or failed connect.
pub const MSG_FAILURE: &str = "failure";

/// Policy name used for connections initiated by an imported-service listener.
pub const DEFAULT_POLICY: &str = "forward";

/// Data-plane technology carrying a connection between gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataplane {
    /// Plain TCP over the hijacked control connection.
    Tcp,
    /// Mutual-TLS tunnel multiplexed by endpoint name.
    Mtls,
}

impl Dataplane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataplane::Tcp => "tcp",
            Dataplane::Mtls => "mtls",
        }
    }
}

impl fmt::Display for Dataplane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataplane {
    type Err = MbgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Dataplane::Tcp),
            "mtls" => Ok(Dataplane::Mtls),
            other => Err(MbgError::UnsupportedDataplane(other.to_string())),
        }
    }
}

/// Request to set up a logical connection `id -> idDest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    /// Source service id.
    pub id: String,
    /// Destination service id.
    pub id_dest: String,
    /// Policy name; selects an optional network function on the path.
    #[serde(default)]
    pub policy: String,
    /// Id of the requesting gateway.
    #[serde(rename = "mbgId", alias = "mbgID")]
    pub mbg_id: String,
}

/// Structured outcome carried in a [`ConnectReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectStatus {
    Success,
    AlreadySetup,
    Failure,
}

/// Reply to a [`ConnectRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReply {
    /// Human-readable outcome.
    pub message: String,
    /// Data-plane type the requester must use.
    #[serde(default)]
    pub connect_type: String,
    /// Data-plane target: a port, an mTLS endpoint name, or [`USE_CONNECT_MODE`].
    #[serde(default)]
    pub connect_dest: String,
    /// Structured outcome. Absent from older peers; see [`ConnectReply::status`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectStatus>,
}

impl ConnectReply {
    pub fn success(dataplane: Dataplane, target: impl Into<String>) -> Self {
        Self {
            message: MSG_SUCCESS.to_string(),
            connect_type: dataplane.to_string(),
            connect_dest: target.into(),
            status: Some(ConnectStatus::Success),
        }
    }

    pub fn already_setup(dataplane: Dataplane, target: impl Into<String>) -> Self {
        Self {
            message: MSG_ALREADY_SETUP.to_string(),
            connect_type: dataplane.to_string(),
            connect_dest: target.into(),
            status: Some(ConnectStatus::AlreadySetup),
        }
    }

    /// The `("failure", "", "")` reply.
    pub fn failure() -> Self {
        Self::failure_with(MSG_FAILURE)
    }

    pub fn failure_with(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connect_type: String::new(),
            connect_dest: String::new(),
            status: Some(ConnectStatus::Failure),
        }
    }

    /// Outcome of this reply, derived from `message` when `status` is absent.
    pub fn status(&self) -> ConnectStatus {
        match self.status {
            Some(status) => status,
            None if self.message == MSG_SUCCESS => ConnectStatus::Success,
            None if self.message == MSG_ALREADY_SETUP => ConnectStatus::AlreadySetup,
            None => ConnectStatus::Failure,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == ConnectStatus::Success
    }
}

/// Maps an error to the reply a peer should see.
impl From<&MbgError> for ConnectReply {
    fn from(e: &MbgError) -> Self {
        match e {
            MbgError::AlreadySetup(_) => Self {
                message: MSG_ALREADY_SETUP.to_string(),
                connect_type: String::new(),
                connect_dest: String::new(),
                status: Some(ConnectStatus::AlreadySetup),
            },
            _ => Self::failure(),
        }
    }
}

/// Announcement of a service a peer gateway exposes to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeRequest {
    pub id: String,
    /// Address of the exposing gateway.
    pub ip: String,
    #[serde(rename = "mbgId", alias = "mbgID")]
    pub mbg_id: String,
}

/// A service record as seen on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: String,
    pub ip: String,
}

/// Registration of a peer gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRequest {
    pub id: String,
    pub ip: String,
    /// Control-plane port.
    pub cport: u16,
    /// mTLS data-plane port.
    pub dport: u16,
}

/// First frame on an mTLS data-plane connection: which endpoint to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHello {
    pub endpoint: String,
}

/// Answer to [`EndpointHello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EndpointAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}
