//! Gateway state shared by every component: identity, peer gateways, the
//! service catalog, and (separately) the port/connection tracker.
//!
//! Components receive an `Arc<GatewayState>` and an `Arc<PortTracker>` at
//! construction; there is no process-wide instance.

pub mod catalog;
pub mod tracker;

pub use catalog::{RemoteService, ServiceCatalog, ServiceRecord};
pub use tracker::{ConnectionLease, PortRange, PortTracker, TrackedConnection};

use mbg_core::{Dataplane, MbgError, MbgResult};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::info;

/// Who this gateway is and how peers reach it.
#[derive(Debug, Clone)]
pub struct GatewayIdentity {
    pub id: String,
    /// Address peers use to reach this gateway.
    pub ip: String,
    pub control_port: u16,
    pub dataplane_port: u16,
    pub dataplane: Dataplane,
    /// Scheme prefix for control-plane URLs, e.g. `http://`.
    pub addr_start: String,
}

/// Certificate triple used by the mTLS data plane.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub root_ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A known peer gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerGateway {
    pub id: String,
    pub ip: String,
    pub control_port: u16,
    pub dataplane_port: u16,
}

impl PeerGateway {
    /// `ip:control_port`, where the handshake is sent.
    pub fn control_target(&self) -> String {
        format!("{}:{}", self.ip, self.control_port)
    }

    /// `ip:dataplane_port`, where mTLS data connections go.
    pub fn dataplane_target(&self) -> String {
        format!("{}:{}", self.ip, self.dataplane_port)
    }
}

pub struct GatewayState {
    identity: GatewayIdentity,
    certs: Option<TlsPaths>,
    catalog: ServiceCatalog,
    peers: RwLock<HashMap<String, PeerGateway>>,
}

impl GatewayState {
    pub fn new(identity: GatewayIdentity, certs: Option<TlsPaths>) -> Self {
        Self {
            identity,
            certs,
            catalog: ServiceCatalog::new(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &GatewayIdentity {
        &self.identity
    }

    pub fn my_id(&self) -> &str {
        &self.identity.id
    }

    pub fn my_ip(&self) -> &str {
        &self.identity.ip
    }

    pub fn dataplane(&self) -> Dataplane {
        self.identity.dataplane
    }

    pub fn addr_start(&self) -> &str {
        &self.identity.addr_start
    }

    pub fn certs(&self) -> Option<&TlsPaths> {
        self.certs.as_ref()
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    /// Register (or replace) a peer gateway.
    pub async fn add_peer(&self, peer: PeerGateway) {
        info!(peer = %peer.id, control = %peer.control_target(), "peer gateway registered");
        self.peers.write().await.insert(peer.id.clone(), peer);
    }

    pub async fn peer(&self, id: &str) -> MbgResult<PeerGateway> {
        self.peers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MbgError::PeerNotFound(id.to_string()))
    }

    pub async fn peers(&self) -> Vec<PeerGateway> {
        let mut all: Vec<_> = self.peers.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Data-plane address of peer `id`.
    pub async fn mbg_target(&self, id: &str) -> MbgResult<String> {
        Ok(self.peer(id).await?.dataplane_target())
    }

    /// Control-plane address of peer `id`.
    pub async fn mbg_control_target(&self, id: &str) -> MbgResult<String> {
        Ok(self.peer(id).await?.control_target())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_targets() {
        let state = GatewayState::new(testing::identity("MBG1", Dataplane::Tcp), None);
        state
            .add_peer(PeerGateway {
                id: "MBG2".into(),
                ip: "172.18.0.3".into(),
                control_port: 30443,
                dataplane_port: 30001,
            })
            .await;

        assert_eq!(state.mbg_control_target("MBG2").await.unwrap(), "172.18.0.3:30443");
        assert_eq!(state.mbg_target("MBG2").await.unwrap(), "172.18.0.3:30001");
        assert!(matches!(
            state.mbg_target("MBG3").await,
            Err(MbgError::PeerNotFound(_))
        ));
    }
}
