//! Listeners that originate and terminate connections on behalf of local
//! workloads.
//!
//! - The *imported-service listener* runs on the local port allocated for a
//!   service imported from a peer. Every connection a local workload makes to
//!   it is admitted, negotiated with the owning peer, and forwarded, each in
//!   its own task.
//! - The *receiver service* is the local end of one incoming mTLS
//!   connection: it dials the local service and relays the peer stream that
//!   arrives on its endpoint.
//!
//! Stopping a listener does not stop the connections it already accepted.

use crate::dataplane::mtls::{MtlsForwarder, MtlsRole, MtlsSettings};
use crate::dataplane::{BoxedStream, EndpointRegistry};
use crate::router::{ConnectionRouter, Timeouts};
use mbg_core::{MbgError, MbgResult};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bind `0.0.0.0:local_port` and serve imported service `service_id` on it.
///
/// # Arguments
///
/// * `router` - Router used to admit, negotiate and forward each connection.
/// * `service_id` - Id of the imported service this port stands in for.
/// * `local_port` - Port to listen on.
/// * `cancel` - Stops the accept loop.
///
/// # Errors
///
/// Returns the bind error, or the accept error that ended the loop.
pub async fn start_local_server_to_remote_service(
    router: Arc<ConnectionRouter>,
    service_id: &str,
    local_port: u16,
    cancel: CancellationToken,
) -> MbgResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", local_port)).await?;
    serve_imported(router, service_id, listener, cancel).await
}

/// Accept loop of an imported-service listener bound by the caller.
pub async fn serve_imported(
    router: Arc<ConnectionRouter>,
    service_id: &str,
    listener: TcpListener,
    cancel: CancellationToken,
) -> MbgResult<()> {
    let addr = listener.local_addr()?;
    info!(service = %service_id, addr = %addr, "imported service listener started");

    loop {
        let (client, remote) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(service = %service_id, "imported service listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted.map_err(|e| {
                warn!(service = %service_id, error = %e, "accept failed, stopping listener");
                MbgError::from(e)
            })?,
        };
        debug!(service = %service_id, remote = %remote, "outgoing connection accepted");

        let router = router.clone();
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = router.forward_imported(&service_id, client, remote).await {
                warn!(service = %service_id, remote = %remote, error = %e, "outgoing connection closed");
            }
        });
    }
}

/// The local end of one incoming mTLS connection.
pub struct ReceiverService {
    /// `host:port` of the local service.
    pub local_addr: String,
    /// Endpoint name handed to the peer.
    pub endpoint: String,
    pub settings: Arc<MtlsSettings>,
    /// Where the mTLS acceptor delivers the peer's stream.
    pub incoming: oneshot::Receiver<BoxedStream>,
    pub timeouts: Timeouts,
}

/// Dial the local service, then relay it with the peer stream that arrives
/// on the receiver's endpoint. The endpoint is unregistered if this fails
/// before the stream arrives.
pub async fn start_receiver_service(
    receiver: ReceiverService,
    endpoints: &EndpointRegistry,
    cancel: CancellationToken,
) -> MbgResult<()> {
    let ReceiverService {
        local_addr,
        endpoint,
        settings,
        incoming,
        timeouts,
    } = receiver;

    let local = match tokio::time::timeout(timeouts.dial, TcpStream::connect(&local_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            endpoints.remove(&endpoint);
            return Err(e.into());
        }
        Err(_) => {
            endpoints.remove(&endpoint);
            return Err(MbgError::Timeout);
        }
    };
    debug!(endpoint = %endpoint, service = %local_addr, "receiver connected to local service");

    let mut forwarder = MtlsForwarder::new(
        local_addr.as_str(),
        endpoint.as_str(),
        settings,
        MtlsRole::Server {
            incoming,
            wait: timeouts.receiver_wait,
        },
    );
    let result = forwarder.run(Box::new(local), cancel).await;
    // No-op once the stream was delivered.
    endpoints.remove(&endpoint);
    result
}
