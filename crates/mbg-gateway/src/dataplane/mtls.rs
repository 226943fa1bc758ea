//! Mutual-TLS forwarding between gateways.
//!
//! Both gateways present a certificate signed by the shared root CA. After
//! the TLS handshake the dialing side sends one [`EndpointHello`] frame naming
//! the endpoint it was given in the connect reply; the accepting side answers
//! with an [`EndpointAck`] and, on success, hands the stream to the receiver
//! registered for that endpoint. Everything after the ack is relayed bytes.

use super::endpoints::EndpointRegistry;
use super::tcp::relay_streams;
use super::{read_frame, write_frame, BoxedStream, ForwarderState};
use crate::certs::{parse_certs, parse_private_key, read_pem};
use crate::state::catalog::host_of;
use crate::state::TlsPaths;
use mbg_core::messages::{EndpointAck, EndpointHello};
use mbg_core::{MbgError, MbgResult};
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS configuration for both directions of the data plane.
#[derive(Clone)]
pub struct MtlsSettings {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl MtlsSettings {
    /// Build client and server configs from PEM buffers. The server side
    /// requires a client certificate signed by `root_ca`.
    pub fn from_pem(root_ca: &[u8], cert: &[u8], key: &[u8]) -> MbgResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for ca in parse_certs(root_ca)? {
            roots
                .add(ca)
                .map_err(|e| MbgError::Tls(format!("invalid root CA: {e}")))?;
        }
        let roots = Arc::new(roots);
        let chain = parse_certs(cert)?;
        let key = parse_private_key(key)?;

        let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| MbgError::Tls(format!("client verifier: {e}")))?;
        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain.clone(), key.clone_key())
            .map_err(tls_err)?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(tls_err)?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: TlsAcceptor::from(Arc::new(server)),
            handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
        })
    }

    /// Load the certificate triple from disk.
    pub fn load(paths: &TlsPaths) -> MbgResult<Self> {
        Self::from_pem(
            &read_pem(&paths.root_ca)?,
            &read_pem(&paths.cert)?,
            &read_pem(&paths.key)?,
        )
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }
}

fn tls_err(e: rustls::Error) -> MbgError {
    MbgError::Tls(e.to_string())
}

/// Which side of the gateway-to-gateway link a forwarder is on.
pub enum MtlsRole {
    /// Dial the peer's data plane at `target` and announce the endpoint.
    Client { target: String },
    /// Wait up to `wait` for the acceptor to hand over the peer's stream.
    Server {
        incoming: oneshot::Receiver<BoxedStream>,
        wait: Duration,
    },
}

pub struct MtlsForwarder {
    name: String,
    endpoint: String,
    settings: Arc<MtlsSettings>,
    role: Option<MtlsRole>,
    state: ForwarderState,
}

impl MtlsForwarder {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        settings: Arc<MtlsSettings>,
        role: MtlsRole,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            settings,
            role: Some(role),
            state: ForwarderState::Initialized,
        }
    }

    pub fn state(&self) -> ForwarderState {
        self.state
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Relay `local` over the mTLS link until either side closes or `cancel`
    /// fires.
    pub async fn run(&mut self, local: BoxedStream, cancel: CancellationToken) -> MbgResult<()> {
        let Some(role) = self.role.take() else {
            return Err(MbgError::Other(format!("forwarder {} already ran", self.name)));
        };
        self.state = ForwarderState::Running;
        let result = match role {
            MtlsRole::Client { target } => self.run_client(&target, local, &cancel).await,
            MtlsRole::Server { incoming, wait } => {
                self.run_server(incoming, wait, local, &cancel).await
            }
        };
        self.state = ForwarderState::Closed;
        if let Err(e) = &result {
            warn!(connection = %self.name, endpoint = %self.endpoint, error = %e, "mTLS forwarder failed");
        }
        result
    }

    async fn run_client(
        &self,
        target: &str,
        local: BoxedStream,
        cancel: &CancellationToken,
    ) -> MbgResult<()> {
        let link = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            link = tokio::time::timeout(self.settings.handshake_timeout, self.open_link(target)) => {
                link.map_err(|_| MbgError::Timeout)??
            }
        };
        info!(connection = %self.name, endpoint = %self.endpoint, target = %target, "mTLS link established");
        relay_streams(&self.name, local, link, cancel).await
    }

    async fn open_link(&self, target: &str) -> MbgResult<BoxedStream> {
        let tcp = TcpStream::connect(target).await?;
        let server_name = ServerName::try_from(host_of(target).to_string())
            .map_err(|e| MbgError::Tls(format!("invalid server name {target}: {e}")))?;
        let mut tls = self
            .settings
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MbgError::Tls(format!("handshake with {target}: {e}")))?;

        write_frame(
            &mut tls,
            &EndpointHello {
                endpoint: self.endpoint.clone(),
            },
        )
        .await?;
        let ack: EndpointAck = read_frame(&mut tls).await?;
        if !ack.accepted {
            return Err(MbgError::Handshake(ack.reason.unwrap_or_else(|| {
                format!("endpoint {} rejected", self.endpoint)
            })));
        }
        Ok(Box::new(tls))
    }

    async fn run_server(
        &self,
        incoming: oneshot::Receiver<BoxedStream>,
        wait: Duration,
        local: BoxedStream,
        cancel: &CancellationToken,
    ) -> MbgResult<()> {
        let link = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            link = tokio::time::timeout(wait, incoming) => match link {
                Ok(Ok(stream)) => stream,
                Ok(Err(_)) => {
                    return Err(MbgError::Other(format!("endpoint {} dropped", self.endpoint)))
                }
                Err(_) => return Err(MbgError::Timeout),
            }
        };
        info!(connection = %self.name, endpoint = %self.endpoint, "mTLS peer attached");
        relay_streams(&self.name, local, link, cancel).await
    }
}

/// Accept mTLS data connections until `cancel` fires or accepting fails.
/// Each connection is authenticated and routed to its endpoint in its own task.
pub async fn serve_mtls(
    listener: TcpListener,
    settings: Arc<MtlsSettings>,
    endpoints: Arc<EndpointRegistry>,
    cancel: CancellationToken,
) -> MbgResult<()> {
    info!(addr = ?listener.local_addr().ok(), "mTLS data plane listening");
    loop {
        let (tcp, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("mTLS data plane stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let settings = settings.clone();
        let endpoints = endpoints.clone();
        tokio::spawn(async move {
            if let Err(e) = route_link(tcp, &settings, &endpoints).await {
                warn!(peer = %peer, error = %e, "rejected mTLS data connection");
            }
        });
    }
}

async fn route_link(
    tcp: TcpStream,
    settings: &MtlsSettings,
    endpoints: &EndpointRegistry,
) -> MbgResult<()> {
    let timeout = settings.handshake_timeout;
    let mut tls = tokio::time::timeout(timeout, settings.acceptor.accept(tcp))
        .await
        .map_err(|_| MbgError::Timeout)?
        .map_err(|e| MbgError::Tls(e.to_string()))?;
    let hello: EndpointHello = tokio::time::timeout(timeout, read_frame(&mut tls))
        .await
        .map_err(|_| MbgError::Timeout)??;

    let Some(receiver) = endpoints.take(&hello.endpoint) else {
        write_frame(&mut tls, &EndpointAck::rejected("unknown endpoint")).await?;
        let _ = tls.shutdown().await;
        return Err(MbgError::Handshake(format!("unknown endpoint {}", hello.endpoint)));
    };
    write_frame(&mut tls, &EndpointAck::accepted()).await?;
    if receiver.send(Box::new(tls)).is_err() {
        return Err(MbgError::Other(format!(
            "receiver for {} is gone",
            hello.endpoint
        )));
    }
    debug!(endpoint = %hello.endpoint, "mTLS stream handed to receiver");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::certs::DevCa;

    pub fn names() -> Vec<String> {
        vec!["localhost".to_string(), "127.0.0.1".to_string()]
    }

    /// Settings for `gateway_id` with a certificate issued by `ca`.
    pub fn settings(ca: &DevCa, gateway_id: &str) -> Arc<MtlsSettings> {
        let issued = ca.issue(gateway_id, &names()).unwrap();
        Arc::new(
            MtlsSettings::from_pem(
                ca.pem().as_bytes(),
                issued.cert_pem.as_bytes(),
                issued.key_pem.as_bytes(),
            )
            .unwrap()
            .with_handshake_timeout(Duration::from_secs(5)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::settings;
    use super::*;
    use crate::certs::DevCa;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_data_plane(
        settings: Arc<MtlsSettings>,
    ) -> (String, Arc<EndpointRegistry>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let endpoints = Arc::new(EndpointRegistry::new());
        let cancel = CancellationToken::new();
        tokio::spawn(serve_mtls(listener, settings, endpoints.clone(), cancel.clone()));
        (addr, endpoints, cancel)
    }

    #[tokio::test]
    async fn relays_between_gateways() {
        let ca = DevCa::generate("test CA").unwrap();
        let server_settings = settings(&ca, "MBG2");
        let client_settings = settings(&ca, "MBG1");
        let (addr, endpoints, _stop) = start_data_plane(server_settings.clone()).await;

        let incoming = endpoints.register("a:b-1").unwrap();
        let (mut service, service_side) = tokio::io::duplex(4096);
        let mut receiver = MtlsForwarder::new(
            "a:b",
            "a:b-1",
            server_settings,
            MtlsRole::Server {
                incoming,
                wait: Duration::from_secs(5),
            },
        );
        let receiver_task = tokio::spawn(async move {
            receiver
                .run(Box::new(service_side), CancellationToken::new())
                .await
        });

        let (mut app, app_side) = tokio::io::duplex(4096);
        let mut sender = MtlsForwarder::new(
            "a:b",
            "a:b-1",
            client_settings,
            MtlsRole::Client { target: addr },
        );
        let sender_task =
            tokio::spawn(async move { sender.run(Box::new(app_side), CancellationToken::new()).await });

        app.write_all(b"over mtls").await.unwrap();
        let mut buf = [0u8; 9];
        tokio::time::timeout(Duration::from_secs(5), service.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"over mtls");

        service.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"reply");

        drop(app);
        tokio::time::timeout(Duration::from_secs(5), sender_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), receiver_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let ca = DevCa::generate("test CA").unwrap();
        let (addr, _endpoints, _stop) = start_data_plane(settings(&ca, "MBG2")).await;

        let (_app, app_side) = tokio::io::duplex(64);
        let mut sender = MtlsForwarder::new(
            "a:b",
            "nobody",
            settings(&ca, "MBG1"),
            MtlsRole::Client { target: addr },
        );
        let err = sender
            .run(Box::new(app_side), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MbgError::Handshake(_)));
        assert_eq!(sender.state(), ForwarderState::Closed);
    }

    #[tokio::test]
    async fn foreign_ca_client_is_refused() {
        let ca = DevCa::generate("fabric CA").unwrap();
        let rogue_ca = DevCa::generate("rogue CA").unwrap();
        let (addr, endpoints, _stop) = start_data_plane(settings(&ca, "MBG2")).await;
        let mut incoming = endpoints.register("a:b-1").unwrap();

        // The rogue client trusts the fabric CA but presents a certificate
        // issued by another CA.
        let rogue = rogue_ca.issue("MBG9", &testing::names()).unwrap();
        let rogue_settings = Arc::new(
            MtlsSettings::from_pem(
                ca.pem().as_bytes(),
                rogue.cert_pem.as_bytes(),
                rogue.key_pem.as_bytes(),
            )
            .unwrap(),
        );

        let (_app, app_side) = tokio::io::duplex(64);
        let mut sender = MtlsForwarder::new(
            "a:b",
            "a:b-1",
            rogue_settings,
            MtlsRole::Client { target: addr },
        );
        assert!(sender
            .run(Box::new(app_side), CancellationToken::new())
            .await
            .is_err());
        assert!(incoming.try_recv().is_err());
        assert!(endpoints.contains("a:b-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_gives_up_waiting() {
        let ca = DevCa::generate("test CA").unwrap();
        let (_tx, incoming) = oneshot::channel::<BoxedStream>();
        let (_service, service_side) = tokio::io::duplex(64);
        let mut receiver = MtlsForwarder::new(
            "a:b",
            "a:b-1",
            settings(&ca, "MBG2"),
            MtlsRole::Server {
                incoming,
                wait: Duration::from_secs(1),
            },
        );
        let err = receiver
            .run(Box::new(service_side), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MbgError::Timeout));
    }

    #[test]
    fn bad_pem_is_tls_error() {
        assert!(matches!(
            MtlsSettings::from_pem(b"x", b"y", b"z"),
            Err(MbgError::Tls(_))
        ));
    }
}
