//! Service catalog: local services hosted in this gateway's domain and
//! remote services imported from peer gateways.
//!
//! Records are replaced, never mutated in place. Reads always observe the
//! latest committed write.

use mbg_core::{MbgError, MbgResult};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A service hosted by this gateway's domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub id: String,
    /// `host:port` of the real service.
    pub ip: String,
}

/// A service imported from a peer gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteService {
    pub id: String,
    /// Address of the owning peer gateway.
    pub ip: String,
    /// Id of the owning peer gateway.
    pub mbg_id: String,
}

/// Catalog of local and imported services.
#[derive(Default)]
pub struct ServiceCatalog {
    local: RwLock<HashMap<String, ServiceRecord>>,
    remote: RwLock<HashMap<String, RemoteService>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a local service.
    pub async fn add_local_service(&self, id: &str, ip: &str) {
        let record = ServiceRecord {
            id: id.to_string(),
            ip: ip.to_string(),
        };
        self.local.write().await.insert(id.to_string(), record);
        info!(service = %id, ip = %ip, "local service registered");
    }

    pub async fn local_service(&self, id: &str) -> Option<ServiceRecord> {
        self.local.read().await.get(id).cloned()
    }

    pub async fn is_service_local(&self, id: &str) -> bool {
        self.local.read().await.contains_key(id)
    }

    /// Register (or replace) a service imported from `mbg_id`.
    pub async fn add_remote_service(&self, id: &str, ip: &str, mbg_id: &str) {
        let record = RemoteService {
            id: id.to_string(),
            ip: ip.to_string(),
            mbg_id: mbg_id.to_string(),
        };
        self.remote.write().await.insert(id.to_string(), record);
        info!(service = %id, peer = %mbg_id, "remote service imported");
    }

    pub async fn remote_service(&self, id: &str) -> Option<RemoteService> {
        self.remote.read().await.get(id).cloned()
    }

    /// Find the local service that owns the host of `remote`, i.e. which
    /// local workload dialed an imported-service listener.
    ///
    /// When several services share a host the one with the smallest id wins,
    /// so the answer is stable.
    pub async fn lookup_local_service(&self, remote: &SocketAddr) -> MbgResult<ServiceRecord> {
        let services = self.local.read().await;
        let found = services
            .values()
            .filter(|s| host_matches(&s.ip, remote.ip()))
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned();

        match found {
            Some(record) => {
                debug!(remote = %remote, service = %record.id, "resolved local service");
                Ok(record)
            }
            None => Err(MbgError::ServiceNotFound(format!(
                "no local service at {}",
                remote.ip()
            ))),
        }
    }

    pub async fn local_services(&self) -> Vec<ServiceRecord> {
        let mut all: Vec<_> = self.local.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn remote_services(&self) -> Vec<RemoteService> {
        let mut all: Vec<_> = self.remote.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Host part of `host:port`, `[v6]:port`, or a bare host.
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        // A bare IPv6 address has more than one colon.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

fn host_matches(record_addr: &str, ip: IpAddr) -> bool {
    let host = host_of(record_addr);
    match host.parse::<IpAddr>() {
        Ok(record_ip) => record_ip == ip || record_ip.to_canonical() == ip.to_canonical(),
        Err(_) => host == ip.to_string(),
    }
}
