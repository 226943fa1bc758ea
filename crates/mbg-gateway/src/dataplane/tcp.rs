//! Plain TCP forwarding between a service-facing socket and the next hop.
//!
//! A [`TcpForwarder`] has a *server* side (the connection it accepts, or a
//! socket handed to it after a connect-mode upgrade) and a *client* side (the
//! connection it dials, or a socket handed to it). Once both exist, bytes are
//! copied in both directions until one direction ends, an error occurs, or
//! the forwarder is cancelled. Both sockets are then shut down.

use super::{BoxedStream, ForwarderState, PendingStream};
use mbg_core::messages::USE_CONNECT_MODE;
use mbg_core::{MbgError, MbgResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpForwarder {
    name: String,
    source: String,
    dest: String,
    listener: Option<TcpListener>,
    server: Option<PendingStream>,
    client: Option<PendingStream>,
    dial_timeout: Duration,
    accept_timeout: Option<Duration>,
    state: ForwarderState,
}

impl TcpForwarder {
    /// Forward from `source` (a listen address, or [`USE_CONNECT_MODE`] when
    /// the server socket is attached later) to `dest`.
    pub fn new(
        source: impl Into<String>,
        dest: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            dest: dest.into(),
            listener: None,
            server: None,
            client: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            accept_timeout: None,
            state: ForwarderState::Initialized,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Give up with [`MbgError::Timeout`] if nobody connects to `source`
    /// within `limit`. Unbounded by default.
    pub fn with_accept_timeout(mut self, limit: Duration) -> Self {
        self.accept_timeout = Some(limit);
        self
    }

    /// Use `stream` instead of accepting on `source`.
    pub fn set_server_connection(&mut self, stream: PendingStream) {
        self.server = Some(stream);
    }

    /// Use `stream` instead of dialing `dest`.
    pub fn set_client_connection(&mut self, stream: PendingStream) {
        self.client = Some(stream);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    /// Address of the prepared source listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bind the source listener now so peers can connect before [`run`](Self::run).
    /// No-op when a server socket is attached or the listener already exists.
    pub async fn prepare(&mut self) -> MbgResult<()> {
        if self.server.is_some() || self.listener.is_some() {
            return Ok(());
        }
        if self.source == USE_CONNECT_MODE {
            return Err(MbgError::Other(format!(
                "forwarder {} is in connect mode but has no server connection",
                self.name
            )));
        }
        let addr = listen_addr(&self.source);
        let listener = TcpListener::bind(&addr).await?;
        debug!(connection = %self.name, addr = %addr, "forwarder listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Run until the relay ends. The forwarder is `Closed` afterwards and
    /// cannot be run again.
    pub async fn run(&mut self, cancel: CancellationToken) -> MbgResult<()> {
        if self.state != ForwarderState::Initialized {
            return Err(MbgError::Other(format!("forwarder {} already ran", self.name)));
        }
        self.state = ForwarderState::Running;
        let result = self.relay(&cancel).await;
        self.state = ForwarderState::Closed;
        match &result {
            Ok(()) => debug!(connection = %self.name, "forwarder closed"),
            Err(e) => warn!(connection = %self.name, error = %e, "forwarder failed"),
        }
        result
    }

    async fn relay(&mut self, cancel: &CancellationToken) -> MbgResult<()> {
        let server = match self.server.take() {
            Some(pending) => resolve(pending, cancel).await?,
            None => {
                self.prepare().await?;
                let listener = self
                    .listener
                    .take()
                    .ok_or_else(|| MbgError::Other("source listener missing".into()))?;
                let accepted = match self.accept_timeout {
                    Some(limit) => tokio::time::timeout(limit, accept_one(&listener, cancel))
                        .await
                        .map_err(|_| MbgError::Timeout)?,
                    None => accept_one(&listener, cancel).await,
                };
                accepted?.map(|s| Box::new(s) as BoxedStream)
            }
        };
        let Some(server) = server else {
            return Ok(());
        };

        let client = match self.client.take() {
            Some(pending) => resolve(pending, cancel).await?,
            None => dial(&self.dest, self.dial_timeout, cancel)
                .await?
                .map(|s| Box::new(s) as BoxedStream),
        };
        let Some(client) = client else {
            return Ok(());
        };

        info!(connection = %self.name, source = %self.source, dest = %self.dest, "forwarding");
        relay_streams(&self.name, server, client, cancel).await
    }
}

/// Copy bytes between `a` and `b` until either direction ends or `cancel`
/// fires, then shut both down.
pub async fn relay_streams(
    name: &str,
    a: BoxedStream,
    b: BoxedStream,
    cancel: &CancellationToken,
) -> MbgResult<()> {
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(connection = %name, "relay cancelled");
            Ok(())
        }
        r = tokio::io::copy(&mut a_read, &mut b_write) => r.map(|n| {
            debug!(connection = %name, bytes = n, "upstream finished");
        }),
        r = tokio::io::copy(&mut b_read, &mut a_write) => r.map(|n| {
            debug!(connection = %name, bytes = n, "downstream finished");
        }),
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    outcome.map_err(MbgError::from)
}

/// Accept a single connection on `listener`. `None` if cancelled first.
pub async fn accept_one(
    listener: &TcpListener,
    cancel: &CancellationToken,
) -> MbgResult<Option<TcpStream>> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        accepted = listener.accept() => {
            let (stream, peer) = accepted?;
            debug!(peer = %peer, "accepted forwarder connection");
            Ok(Some(stream))
        }
    }
}

async fn resolve(
    pending: PendingStream,
    cancel: &CancellationToken,
) -> MbgResult<Option<BoxedStream>> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        stream = pending => Ok(Some(stream?)),
    }
}

async fn dial(
    dest: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> MbgResult<Option<TcpStream>> {
    tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        dialed = tokio::time::timeout(timeout, TcpStream::connect(dest)) => match dialed {
            Ok(Ok(stream)) => Ok(Some(stream)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(MbgError::Timeout),
        }
    }
}

/// `":5000"` listens on every interface.
fn listen_addr(source: &str) -> String {
    if source.starts_with(':') {
        format!("0.0.0.0{source}")
    } else {
        source.to_string()
    }
}

/// Where a connection goes and whether a network function sits in between.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub name: String,
    pub source: String,
    pub dest: String,
    pub policy_target: Option<String>,
    pub dial_timeout: Duration,
    /// Bound on each leg's wait for its first inbound connection.
    pub accept_timeout: Option<Duration>,
}

impl ServiceRoute {
    pub fn new(name: impl Into<String>, source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            dest: dest.into(),
            policy_target: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            accept_timeout: None,
        }
    }

    pub fn with_policy_target(mut self, target: Option<String>) -> Self {
        self.policy_target = target.filter(|t| !t.is_empty());
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_accept_timeout(mut self, limit: Duration) -> Self {
        self.accept_timeout = Some(limit);
        self
    }
}

/// Forwarders for one connection with their listeners already bound.
pub enum PreparedService {
    Direct(TcpForwarder),
    Split {
        ingress: TcpForwarder,
        egress: TcpForwarder,
    },
}

impl PreparedService {
    /// Bind every listener the data path of `route` needs.
    ///
    /// Without a policy target this is one forwarder `source → dest`. With
    /// one the path is split at the network function: `ingress: source →
    /// target` carries the attached server socket and `egress: target →
    /// dest` carries the attached client socket. The egress listener on
    /// `target` is bound before the ingress one.
    pub async fn prepare(
        route: ServiceRoute,
        server: Option<PendingStream>,
        client: Option<PendingStream>,
    ) -> MbgResult<Self> {
        let Some(target) = route.policy_target.clone() else {
            let mut forwarder = TcpForwarder::new(route.source, route.dest, route.name)
                .with_dial_timeout(route.dial_timeout);
            forwarder.accept_timeout = route.accept_timeout;
            if let Some(server) = server {
                forwarder.set_server_connection(server);
            }
            if let Some(client) = client {
                forwarder.set_client_connection(client);
            }
            forwarder.prepare().await?;
            return Ok(Self::Direct(forwarder));
        };

        info!(connection = %route.name, target = %target, "splitting connection at network function");
        let mut ingress =
            TcpForwarder::new(&route.source, &target, format!("{}-ingress", route.name))
                .with_dial_timeout(route.dial_timeout);
        let mut egress = TcpForwarder::new(&target, &route.dest, format!("{}-egress", route.name))
            .with_dial_timeout(route.dial_timeout);
        ingress.accept_timeout = route.accept_timeout;
        egress.accept_timeout = route.accept_timeout;
        if let Some(server) = server {
            ingress.set_server_connection(server);
        }
        if let Some(client) = client {
            egress.set_client_connection(client);
        }
        egress.prepare().await?;
        ingress.prepare().await?;
        Ok(Self::Split { ingress, egress })
    }

    /// Run to completion. Each split leg runs in its own task; when one leg
    /// ends the other is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> MbgResult<()> {
        let (ingress, egress) = match self {
            Self::Direct(mut forwarder) => return forwarder.run(cancel).await,
            Self::Split { ingress, egress } => (ingress, egress),
        };

        let ingress_cancel = cancel.child_token();
        let egress_cancel = cancel.child_token();
        let ingress_task = tokio::spawn(run_leg(ingress, ingress_cancel.clone(), egress_cancel.clone()));
        let egress_task = tokio::spawn(run_leg(egress, egress_cancel, ingress_cancel));

        let (ingress_result, egress_result) = tokio::join!(ingress_task, egress_task);
        let ingress_result =
            ingress_result.map_err(|e| MbgError::Other(format!("ingress leg: {e}")))?;
        let egress_result = egress_result.map_err(|e| MbgError::Other(format!("egress leg: {e}")))?;
        ingress_result.and(egress_result)
    }
}

/// Run the data path for one connection, see [`PreparedService::prepare`].
pub async fn connect_service(
    route: ServiceRoute,
    server: Option<PendingStream>,
    client: Option<PendingStream>,
    cancel: CancellationToken,
) -> MbgResult<()> {
    PreparedService::prepare(route, server, client)
        .await?
        .run(cancel)
        .await
}

async fn run_leg(
    mut forwarder: TcpForwarder,
    own: CancellationToken,
    sibling: CancellationToken,
) -> MbgResult<()> {
    let result = forwarder.run(own).await;
    sibling.cancel();
    result
}
