//! Connection router: decides how a connect request is served.
//!
//! # Local destination
//!
//! The requested service lives in this gateway's domain. After admission
//! (direction incoming) the data path depends on the configured data plane:
//!
//! - `tcp`: the request arrived as a connect-mode upgrade, so the control
//!   connection becomes the data path. A forwarder binds it to the local
//!   service and the reply says `use connect mode`.
//! - `mtls`: a unique endpoint name is registered with the mTLS acceptor
//!   before the reply is sent; a receiver dials the local service and waits
//!   for the peer's authenticated stream on that endpoint.
//!
//! Several connections for the same service pair may coexist, so local
//! setups never conflict with each other.
//!
//! # Remote destination
//!
//! The requested service was imported from a peer gateway. After admission
//! (direction outgoing) a local/external port pair is reserved under the
//! connection id, which makes the id exclusive: a second request for a live
//! id is answered `alreadySetup` with the existing external port. The peer
//! is then asked to set up its side; any failure releases the reservation.

use crate::dataplane::mtls::{MtlsForwarder, MtlsRole, MtlsSettings};
use crate::dataplane::tcp::{accept_one, connect_service, PreparedService, ServiceRoute};
use crate::dataplane::{ready_stream, BoxedStream, EndpointRegistry, PendingStream};
use crate::handshake::PeerClient;
use crate::listener::{serve_imported, start_receiver_service, ReceiverService};
use crate::policy::{
    admit, resolve_policy_target, AdmissionEvent, AdmissionGate, ConnectionRequestAttr, Direction,
    NewRemoteServiceAttr,
};
use crate::state::{GatewayState, PeerGateway, PortTracker};
use mbg_core::messages::{
    ConnectReply, ConnectRequest, ExposeRequest, DEFAULT_POLICY, USE_CONNECT_MODE,
};
use mbg_core::{ConnectionId, Dataplane, MbgError, MbgResult, PortAssignment};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Bounds on the waits a connection setup may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Policy decisions and policy target lookups.
    pub admission: Duration,
    /// Control-plane requests to peers and TLS handshakes.
    pub handshake: Duration,
    /// How long a prepared connection waits for its first stream: the
    /// peer's mTLS stream on a receiver, or the local client on a port
    /// reserved by a remote setup.
    pub receiver_wait: Duration,
    /// Dialing local services and network functions.
    pub dial: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            admission: Duration::from_secs(5),
            handshake: Duration::from_secs(10),
            receiver_wait: Duration::from_secs(30),
            dial: Duration::from_secs(10),
        }
    }
}

/// Result of announcing a local service to every peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExposeOutcome {
    pub announced: usize,
    pub failed: usize,
}

/// The data path negotiated with a peer.
enum PeerLink {
    /// Connect mode: the upgraded control connection.
    Socket(BoxedStream),
    /// mTLS: the endpoint to announce on the peer's data plane.
    Endpoint(String),
}

pub struct ConnectionRouter {
    state: Arc<GatewayState>,
    tracker: Arc<PortTracker>,
    gate: Arc<dyn AdmissionGate>,
    peers: PeerClient,
    endpoints: Arc<EndpointRegistry>,
    mtls: Option<Arc<MtlsSettings>>,
    timeouts: Timeouts,
}

impl ConnectionRouter {
    pub fn new(
        state: Arc<GatewayState>,
        tracker: Arc<PortTracker>,
        gate: Arc<dyn AdmissionGate>,
        mtls: Option<Arc<MtlsSettings>>,
        timeouts: Timeouts,
    ) -> MbgResult<Self> {
        if state.dataplane() == Dataplane::Mtls && mtls.is_none() {
            return Err(MbgError::Config(
                "the mtls data plane needs certificates".into(),
            ));
        }
        let peers = PeerClient::new(state.my_id(), state.addr_start(), timeouts.handshake)?;
        Ok(Self {
            state,
            tracker,
            gate,
            peers,
            endpoints: Arc::new(EndpointRegistry::new()),
            mtls,
            timeouts,
        })
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub fn tracker(&self) -> &Arc<PortTracker> {
        &self.tracker
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn mtls(&self) -> Option<&Arc<MtlsSettings>> {
        self.mtls.as_ref()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Serve a connect request from the gateway at `peer_ip`.
    ///
    /// `inbound` is the control connection when the request came in connect
    /// mode; it only resolves once the caller has switched protocols.
    pub async fn handle_connect(
        &self,
        request: &ConnectRequest,
        peer_ip: &str,
        inbound: Option<PendingStream>,
    ) -> ConnectReply {
        let result = if self.state.catalog().is_service_local(&request.id_dest).await {
            self.setup_local(request, peer_ip, inbound).await
        } else {
            self.setup_remote(request).await
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(src = %request.id, dst = %request.id_dest, error = %e, "connect request failed");
                ConnectReply::from(&e)
            }
        }
    }

    async fn admit_connection(
        &self,
        src: &str,
        dst: &str,
        direction: Direction,
        other_mbg: &str,
    ) -> MbgResult<()> {
        let event = AdmissionEvent::NewConnectionRequest(ConnectionRequestAttr {
            src_service: src.to_string(),
            dst_service: dst.to_string(),
            direction,
            other_mbg: other_mbg.to_string(),
        });
        if admit(self.gate.as_ref(), &event, self.timeouts.admission).await {
            Ok(())
        } else {
            Err(MbgError::AdmissionDenied(format!("{src}:{dst}")))
        }
    }

    async fn policy_target(&self, policy: &str) -> Option<String> {
        resolve_policy_target(self.gate.as_ref(), policy, self.timeouts.admission).await
    }

    async fn setup_local(
        &self,
        request: &ConnectRequest,
        peer_ip: &str,
        inbound: Option<PendingStream>,
    ) -> MbgResult<ConnectReply> {
        let conn_id = ConnectionId::new(&request.id, &request.id_dest);
        info!(connection = %conn_id, peer = %request.mbg_id, "incoming connect request");

        let service = self
            .state
            .catalog()
            .local_service(&request.id_dest)
            .await
            .ok_or_else(|| MbgError::ServiceNotFound(request.id_dest.clone()))?;
        let peer_target = self
            .state
            .mbg_target(&request.mbg_id)
            .await
            .unwrap_or_else(|_| peer_ip.to_string());

        self.admit_connection(&request.id, &request.id_dest, Direction::Incoming, &request.mbg_id)
            .await?;

        match self.state.dataplane() {
            Dataplane::Tcp => {
                let inbound = inbound.ok_or_else(|| {
                    MbgError::Handshake("the tcp data plane needs a connect-mode request".into())
                })?;
                let lease = self.tracker.track(&conn_id.unique_name())?;
                let route = ServiceRoute::new(conn_id.as_str(), USE_CONNECT_MODE, &service.ip)
                    .with_policy_target(self.policy_target(&request.policy).await)
                    .with_dial_timeout(self.timeouts.dial);
                let prepared = PreparedService::prepare(route, Some(inbound), None).await?;

                tokio::spawn(async move {
                    let cancel = lease.cancel_token();
                    if let Err(e) = prepared.run(cancel).await {
                        debug!(key = %lease.key(), error = %e, "incoming connection ended with error");
                    }
                    drop(lease);
                });
                info!(connection = %conn_id, service = %service.ip, "serving connection in connect mode");
                Ok(ConnectReply::success(Dataplane::Tcp, USE_CONNECT_MODE))
            }
            Dataplane::Mtls => {
                let settings = self
                    .mtls
                    .clone()
                    .ok_or_else(|| MbgError::Config("mtls settings missing".into()))?;
                let endpoint = conn_id.unique_name();
                let incoming = self
                    .endpoints
                    .register(&endpoint)
                    .ok_or_else(|| MbgError::AlreadySetup(endpoint.clone()))?;
                let lease = match self.tracker.track(&endpoint) {
                    Ok(lease) => lease,
                    Err(e) => {
                        self.endpoints.remove(&endpoint);
                        return Err(e);
                    }
                };

                let receiver = ReceiverService {
                    local_addr: service.ip.clone(),
                    endpoint: endpoint.clone(),
                    settings,
                    incoming,
                    timeouts: self.timeouts,
                };
                let endpoints = self.endpoints.clone();
                tokio::spawn(async move {
                    let cancel = lease.cancel_token();
                    if let Err(e) = start_receiver_service(receiver, &endpoints, cancel).await {
                        debug!(key = %lease.key(), error = %e, "receiver ended with error");
                    }
                    drop(lease);
                });
                info!(
                    connection = %conn_id,
                    endpoint = %endpoint,
                    peer = %peer_target,
                    "receiver waiting for mTLS stream"
                );
                Ok(ConnectReply::success(Dataplane::Mtls, endpoint))
            }
        }
    }

    async fn setup_remote(&self, request: &ConnectRequest) -> MbgResult<ConnectReply> {
        let conn_id = ConnectionId::new(&request.id, &request.id_dest);
        info!(connection = %conn_id, "outgoing connect request");

        let remote = self
            .state
            .catalog()
            .remote_service(&request.id_dest)
            .await
            .ok_or_else(|| MbgError::ServiceNotFound(request.id_dest.clone()))?;
        let peer = self.state.peer(&remote.mbg_id).await?;

        self.admit_connection(&request.id, &request.id_dest, Direction::Outgoing, &peer.id)
            .await?;

        let dataplane = self.state.dataplane();
        let lease = match self.tracker.allocate(conn_id.as_str()) {
            Ok(lease) => lease,
            Err(MbgError::AlreadySetup(_)) => {
                let external = self
                    .tracker
                    .assignment(conn_id.as_str())
                    .map(|p| p.external.to_string())
                    .unwrap_or_default();
                info!(connection = %conn_id, external = %external, "connection already set up");
                return Ok(ConnectReply::already_setup(dataplane, external));
            }
            Err(e) => return Err(e),
        };
        let ports = lease
            .ports()
            .cloned()
            .ok_or_else(|| MbgError::Other("reservation without ports".into()))?;

        // The reservation is dropped, and the id freed, on every early return.
        let link = match self
            .negotiate(&request.id, &request.id_dest, &request.policy, &peer, dataplane)
            .await
        {
            Ok(link) => link,
            Err(MbgError::AlreadySetup(_)) => {
                info!(connection = %conn_id, peer = %peer.id, "peer reports connection already set up");
                return Ok(ConnectReply::already_setup(dataplane, ""));
            }
            Err(e) => {
                warn!(connection = %conn_id, peer = %peer.id, error = %e, "peer handshake failed");
                return Ok(ConnectReply::failure_with(peer_message(e)));
            }
        };

        let listen = format!("0.0.0.0:{}", ports.local);
        match link {
            PeerLink::Socket(socket) => {
                let route = ServiceRoute::new(conn_id.as_str(), &listen, peer.control_target())
                    .with_policy_target(self.policy_target(&request.policy).await)
                    .with_dial_timeout(self.timeouts.dial)
                    .with_accept_timeout(self.timeouts.receiver_wait);
                let prepared =
                    PreparedService::prepare(route, None, Some(ready_stream(socket))).await?;
                tokio::spawn(async move {
                    let cancel = lease.cancel_token();
                    if let Err(e) = prepared.run(cancel).await {
                        debug!(key = %lease.key(), error = %e, "outgoing connection ended with error");
                    }
                    drop(lease);
                });
            }
            PeerLink::Endpoint(endpoint) => {
                let settings = self
                    .mtls
                    .clone()
                    .ok_or_else(|| MbgError::Config("mtls settings missing".into()))?;
                let listener = TcpListener::bind(&listen).await?;
                let target = peer.dataplane_target();
                let name = conn_id.to_string();
                let wait = self.timeouts.receiver_wait;
                tokio::spawn(async move {
                    let cancel = lease.cancel_token();
                    // The peer drops the endpoint after the same wait.
                    let local = match tokio::time::timeout(wait, accept_one(&listener, &cancel)).await {
                        Ok(Ok(Some(local))) => local,
                        Ok(Ok(None)) => return,
                        Ok(Err(e)) => {
                            warn!(connection = %name, error = %e, "accepting local client failed");
                            return;
                        }
                        Err(_) => {
                            info!(connection = %name, "no local client arrived, releasing ports");
                            return;
                        }
                    };
                    drop(listener);
                    let mut forwarder =
                        MtlsForwarder::new(&name, endpoint, settings, MtlsRole::Client { target });
                    if let Err(e) = forwarder.run(Box::new(local), cancel).await {
                        debug!(key = %lease.key(), error = %e, "outgoing connection ended with error");
                    }
                    drop(lease);
                });
            }
        }

        info!(
            connection = %conn_id,
            dataplane = %dataplane,
            local = ports.local,
            external = ports.external,
            "connection ready"
        );
        Ok(ConnectReply::success(dataplane, ports.external.to_string()))
    }

    /// Ask `peer` to set up its side of `src → dst`.
    async fn negotiate(
        &self,
        src: &str,
        dst: &str,
        policy: &str,
        peer: &PeerGateway,
        dataplane: Dataplane,
    ) -> MbgResult<PeerLink> {
        let control = peer.control_target();
        match dataplane {
            Dataplane::Tcp => {
                let socket = self
                    .peers
                    .request_connect_upgrade(src, dst, policy, &control)
                    .await?;
                Ok(PeerLink::Socket(socket))
            }
            Dataplane::Mtls => {
                let (peer_dataplane, target) =
                    self.peers.request_connect(src, dst, policy, &control).await?;
                if peer_dataplane != Dataplane::Mtls {
                    return Err(MbgError::UnsupportedDataplane(format!(
                        "peer {} answered with {peer_dataplane}",
                        peer.id
                    )));
                }
                Ok(PeerLink::Endpoint(target))
            }
        }
    }

    /// Import a service announced by a peer gateway and, if admitted, start
    /// the local listener that proxies it.
    ///
    /// Returns the listener's ports. A denied service stays in the catalog
    /// without a listener.
    pub async fn expose_remote_service(
        self: &Arc<Self>,
        request: &ExposeRequest,
    ) -> MbgResult<PortAssignment> {
        self.state
            .catalog()
            .add_remote_service(&request.id, &request.ip, &request.mbg_id)
            .await;

        let event = AdmissionEvent::NewRemoteService(NewRemoteServiceAttr {
            service: request.id.clone(),
            mbg: request.mbg_id.clone(),
        });
        if !admit(self.gate.as_ref(), &event, self.timeouts.admission).await {
            return Err(MbgError::AdmissionDenied(request.id.clone()));
        }

        let lease = match self.tracker.allocate(&request.id) {
            Ok(lease) => lease,
            Err(MbgError::AlreadySetup(key)) => {
                debug!(service = %request.id, "imported service already has a listener");
                return self
                    .tracker
                    .assignment(&request.id)
                    .ok_or(MbgError::AlreadySetup(key));
            }
            Err(e) => return Err(e),
        };
        let ports = lease
            .ports()
            .cloned()
            .ok_or_else(|| MbgError::Other("reservation without ports".into()))?;
        let listener = TcpListener::bind(("0.0.0.0", ports.local)).await?;

        let router = self.clone();
        let service_id = request.id.clone();
        tokio::spawn(async move {
            let cancel = lease.cancel_token();
            if let Err(e) = serve_imported(router, &service_id, listener, cancel).await {
                warn!(service = %service_id, error = %e, "imported service listener failed");
            }
            drop(lease);
        });
        info!(service = %request.id, peer = %request.mbg_id, port = ports.local, "imported service listening");
        Ok(ports)
    }

    /// Announce local service `id` to every known peer.
    pub async fn expose_local_service(&self, id: &str) -> MbgResult<ExposeOutcome> {
        if !self.state.catalog().is_service_local(id).await {
            return Err(MbgError::ServiceNotFound(id.to_string()));
        }
        let request = ExposeRequest {
            id: id.to_string(),
            ip: self.state.my_ip().to_string(),
            mbg_id: self.state.my_id().to_string(),
        };

        let mut outcome = ExposeOutcome::default();
        for peer in self.state.peers().await {
            match self.peers.expose(&peer.control_target(), &request).await {
                Ok(()) => {
                    info!(service = %id, peer = %peer.id, "service exposed");
                    outcome.announced += 1;
                }
                Err(e) => {
                    warn!(service = %id, peer = %peer.id, error = %e, "exposing service failed");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Carry one connection accepted by the listener of imported service
    /// `service_id` to the peer that owns it.
    ///
    /// The caller runs this in a task per connection; errors close only
    /// `client`.
    pub async fn forward_imported(
        &self,
        service_id: &str,
        client: TcpStream,
        remote: SocketAddr,
    ) -> MbgResult<()> {
        let catalog = self.state.catalog();
        let local = catalog.lookup_local_service(&remote).await?;
        let imported = catalog
            .remote_service(service_id)
            .await
            .ok_or_else(|| MbgError::ServiceNotFound(service_id.to_string()))?;
        let peer = self.state.peer(&imported.mbg_id).await?;
        let conn_id = ConnectionId::new(&local.id, service_id);
        info!(connection = %conn_id, remote = %remote, peer = %peer.id, "outgoing connection");

        self.admit_connection(&local.id, service_id, Direction::Outgoing, &peer.id)
            .await?;

        let dataplane = self.state.dataplane();
        let link = match self
            .negotiate(&local.id, service_id, DEFAULT_POLICY, &peer, dataplane)
            .await
        {
            Ok(link) => link,
            Err(MbgError::AlreadySetup(_)) => {
                // The live path keeps serving; this duplicate client is closed.
                info!(
                    connection = %conn_id,
                    remote = %remote,
                    "peer reports connection already set up, closing client"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let lease = self.tracker.track(&conn_id.unique_name())?;
        let cancel = lease.cancel_token();
        match link {
            PeerLink::Socket(socket) => {
                let route = ServiceRoute::new(conn_id.as_str(), USE_CONNECT_MODE, peer.control_target())
                    .with_policy_target(self.policy_target(DEFAULT_POLICY).await)
                    .with_dial_timeout(self.timeouts.dial);
                connect_service(route, Some(ready_stream(client)), Some(ready_stream(socket)), cancel)
                    .await
            }
            PeerLink::Endpoint(endpoint) => {
                let settings = self
                    .mtls
                    .clone()
                    .ok_or_else(|| MbgError::Config("mtls settings missing".into()))?;
                let mut forwarder = MtlsForwarder::new(
                    conn_id.as_str(),
                    endpoint,
                    settings,
                    MtlsRole::Client {
                        target: peer.dataplane_target(),
                    },
                );
                forwarder.run(Box::new(client), cancel).await
            }
        }
    }
}

/// The message to pass on when a peer handshake fails.
fn peer_message(e: MbgError) -> String {
    match e {
        MbgError::Handshake(message) => message,
        other => other.to_string(),
    }
}
