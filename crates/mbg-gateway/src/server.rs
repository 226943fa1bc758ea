//! Gateway server: the HTTP control plane plus the mTLS data-plane acceptor.
//!
//! # Routes
//!
//! | Method | Path                   | Purpose                                        |
//! |--------|------------------------|------------------------------------------------|
//! | POST   | `/connect`             | Connect request, JSON reply                    |
//! | GET    | `/connect?…`           | Connect request in connect mode (upgrade)      |
//! | POST   | `/expose`              | A peer announces one of its services           |
//! | POST   | `/service`             | Register a local service                       |
//! | GET    | `/service`             | List local services                            |
//! | GET    | `/service/:id`         | Show one local service                         |
//! | POST   | `/service/:id/expose`  | Announce a local service to every peer         |
//! | GET    | `/remoteservice`       | List imported services                         |
//! | POST   | `/peer`                | Register a peer gateway                        |
//! | GET    | `/peer`                | List peer gateways                             |

use crate::dataplane::{serve_mtls, BoxedStream, PendingStream};
use crate::router::ConnectionRouter;
use crate::state::PeerGateway;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use mbg_core::messages::{
    ConnectReply, ConnectRequest, ExposeRequest, PeerRequest, ServiceRequest, CONNECT_PATH,
    CONNECT_UPGRADE, USE_CONNECT_MODE,
};
use mbg_core::{ConnectStatus, MbgError, MbgResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type Shared = Arc<ConnectionRouter>;

pub struct GatewayServer {
    router: Shared,
}

impl GatewayServer {
    pub fn new(router: Shared) -> Self {
        Self { router }
    }

    /// The control-plane routes.
    pub fn app(&self) -> Router {
        Router::new()
            .route(CONNECT_PATH, post(connect_json).get(connect_upgrade))
            .route("/expose", post(expose))
            .route("/service", post(add_service).get(list_services))
            .route("/service/:id", get(get_service))
            .route("/service/:id/expose", post(expose_service))
            .route("/remoteservice", get(list_remote_services))
            .route("/peer", post(add_peer).get(list_peers))
            .with_state(self.router.clone())
    }

    /// Serve until `shutdown` fires.
    ///
    /// The data-plane listener is required when the gateway uses the mTLS
    /// data plane and ignored otherwise. Connections already forwarding keep
    /// running after shutdown.
    pub async fn serve(
        self,
        control: TcpListener,
        dataplane: Option<TcpListener>,
        shutdown: CancellationToken,
    ) -> MbgResult<()> {
        if let Some(settings) = self.router.mtls() {
            let listener = dataplane.ok_or_else(|| {
                MbgError::Config("the mtls data plane needs a data-plane listener".into())
            })?;
            let settings = settings.clone();
            let endpoints = self.router.endpoints().clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = serve_mtls(listener, settings, endpoints, cancel).await {
                    warn!(error = %e, "mTLS data plane stopped");
                }
            });
        }

        info!(
            gateway = %self.router.state().my_id(),
            addr = ?control.local_addr().ok(),
            dataplane = %self.router.state().dataplane(),
            "control plane listening"
        );
        let app = self.app();
        axum::serve(
            control,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
        info!("control plane stopped");
        Ok(())
    }
}

fn reply_status(reply: &ConnectReply) -> StatusCode {
    match reply.status() {
        ConnectStatus::Success => StatusCode::OK,
        ConnectStatus::AlreadySetup => StatusCode::CONFLICT,
        ConnectStatus::Failure => StatusCode::FORBIDDEN,
    }
}

fn error_response(e: &MbgError) -> Response {
    let status = match e {
        MbgError::AdmissionDenied(_) => StatusCode::FORBIDDEN,
        MbgError::AlreadySetup(_) => StatusCode::CONFLICT,
        MbgError::ServiceNotFound(_) | MbgError::PeerNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

async fn connect_json(
    State(router): State<Shared>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<ConnectRequest>,
) -> (StatusCode, Json<ConnectReply>) {
    let reply = router
        .handle_connect(&request, &peer.ip().to_string(), None)
        .await;
    (reply_status(&reply), Json(reply))
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(CONNECT_UPGRADE))
}

async fn connect_upgrade(
    State(router): State<Shared>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(request): Query<ConnectRequest>,
    mut req: Request,
) -> Response {
    if !wants_upgrade(req.headers()) {
        let reply = ConnectReply::failure_with("connect mode requires an upgrade");
        return (StatusCode::BAD_REQUEST, Json(reply)).into_response();
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    let inbound: PendingStream = Box::pin(async move {
        let upgraded = on_upgrade.await.map_err(std::io::Error::other)?;
        Ok(Box::new(TokioIo::new(upgraded)) as BoxedStream)
    });

    let reply = router
        .handle_connect(&request, &peer.ip().to_string(), Some(inbound))
        .await;
    if reply.is_success() && reply.connect_dest == USE_CONNECT_MODE {
        return (
            StatusCode::SWITCHING_PROTOCOLS,
            [
                (header::CONNECTION, "upgrade"),
                (header::UPGRADE, CONNECT_UPGRADE),
            ],
        )
            .into_response();
    }
    (reply_status(&reply), Json(reply)).into_response()
}

async fn expose(State(router): State<Shared>, Json(request): Json<ExposeRequest>) -> Response {
    match router.expose_remote_service(&request).await {
        Ok(ports) => Json(ports).into_response(),
        Err(e) => {
            warn!(service = %request.id, peer = %request.mbg_id, error = %e, "expose rejected");
            error_response(&e)
        }
    }
}

async fn add_service(
    State(router): State<Shared>,
    Json(request): Json<ServiceRequest>,
) -> StatusCode {
    router
        .state()
        .catalog()
        .add_local_service(&request.id, &request.ip)
        .await;
    StatusCode::OK
}

async fn list_services(State(router): State<Shared>) -> Response {
    Json(router.state().catalog().local_services().await).into_response()
}

async fn get_service(State(router): State<Shared>, Path(id): Path<String>) -> Response {
    match router.state().catalog().local_service(&id).await {
        Some(service) => Json(service).into_response(),
        None => error_response(&MbgError::ServiceNotFound(id)),
    }
}

async fn expose_service(State(router): State<Shared>, Path(id): Path<String>) -> Response {
    match router.expose_local_service(&id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_remote_services(State(router): State<Shared>) -> Response {
    Json(router.state().catalog().remote_services().await).into_response()
}

async fn add_peer(State(router): State<Shared>, Json(request): Json<PeerRequest>) -> StatusCode {
    router
        .state()
        .add_peer(PeerGateway {
            id: request.id,
            ip: request.ip,
            control_port: request.cport,
            dataplane_port: request.dport,
        })
        .await;
    StatusCode::OK
}

async fn list_peers(State(router): State<Shared>) -> Response {
    Json(router.state().peers().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::DevCa;
    use crate::dataplane::mtls::testing::settings;
    use crate::dataplane::MtlsSettings;
    use crate::policy::testing::FixedGate;
    use crate::router::testing::{echo_server, timeouts, tracker};
    use crate::state::{GatewayIdentity, GatewayState};
    use mbg_core::{Dataplane, PortAssignment};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct TestGateway {
        router: Arc<ConnectionRouter>,
        peer: PeerGateway,
        _stop: tokio_util::sync::DropGuard,
    }

    impl TestGateway {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.peer.control_target(), path)
        }
    }

    async fn spawn_gateway(
        id: &str,
        dataplane: Dataplane,
        gate: FixedGate,
        mtls: Option<Arc<MtlsSettings>>,
    ) -> TestGateway {
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = PeerGateway {
            id: id.to_string(),
            ip: "127.0.0.1".to_string(),
            control_port: control.local_addr().unwrap().port(),
            dataplane_port: data.local_addr().unwrap().port(),
        };
        let identity = GatewayIdentity {
            id: id.to_string(),
            ip: peer.ip.clone(),
            control_port: peer.control_port,
            dataplane_port: peer.dataplane_port,
            dataplane,
            addr_start: "http://".to_string(),
        };
        let state = Arc::new(GatewayState::new(identity, None));
        let router = Arc::new(
            ConnectionRouter::new(state, tracker(), Arc::new(gate), mtls, timeouts()).unwrap(),
        );
        let stop = CancellationToken::new();
        tokio::spawn(GatewayServer::new(router.clone()).serve(control, Some(data), stop.clone()));
        TestGateway {
            router,
            peer,
            _stop: stop.drop_guard(),
        }
    }

    /// MBG1 imports `web` from MBG2; `client` is a workload behind MBG1.
    async fn pair(dataplane: Dataplane) -> (TestGateway, TestGateway) {
        let (mtls1, mtls2) = match dataplane {
            Dataplane::Tcp => (None, None),
            Dataplane::Mtls => {
                let ca = DevCa::generate("fabric CA").unwrap();
                (Some(settings(&ca, "MBG1")), Some(settings(&ca, "MBG2")))
            }
        };
        let mbg1 = spawn_gateway("MBG1", dataplane, FixedGate::allow(), mtls1).await;
        let mbg2 = spawn_gateway("MBG2", dataplane, FixedGate::allow(), mtls2).await;
        mbg1.router.state().add_peer(mbg2.peer.clone()).await;
        mbg2.router.state().add_peer(mbg1.peer.clone()).await;

        let echo = echo_server().await;
        mbg2.router
            .state()
            .catalog()
            .add_local_service("web", &echo.to_string())
            .await;
        mbg1.router
            .state()
            .catalog()
            .add_local_service("client", "127.0.0.1:1")
            .await;
        (mbg1, mbg2)
    }

    async fn round_trip(port: u16, msg: &[u8]) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("echo through both gateways")
            .unwrap();
        assert_eq!(buf, msg);
    }

    async fn imported_port(mbg1: &TestGateway, mbg2: &TestGateway) -> u16 {
        let outcome = mbg2.router.expose_local_service("web").await.unwrap();
        assert_eq!(outcome.announced, 1);
        let ports: PortAssignment = mbg1.router.tracker().assignment("web").unwrap();
        ports.local
    }

    #[tokio::test]
    async fn imported_service_over_tcp() {
        let (mbg1, mbg2) = pair(Dataplane::Tcp).await;
        let port = imported_port(&mbg1, &mbg2).await;
        round_trip(port, b"plain tcp through two gateways").await;
        round_trip(port, b"second connection").await;
    }

    #[tokio::test]
    async fn imported_service_over_mtls() {
        let (mbg1, mbg2) = pair(Dataplane::Mtls).await;
        let port = imported_port(&mbg1, &mbg2).await;
        round_trip(port, b"mutual tls through two gateways").await;
    }

    #[tokio::test]
    async fn explicit_connect_over_tcp() {
        let (mbg1, _mbg2) = pair(Dataplane::Tcp).await;
        mbg1.router
            .state()
            .catalog()
            .add_remote_service("web", "127.0.0.1", "MBG2")
            .await;

        let request = ConnectRequest {
            id: "client".into(),
            id_dest: "web".into(),
            policy: String::new(),
            mbg_id: "MBG1".into(),
        };
        let reply: ConnectReply = reqwest::Client::new()
            .post(mbg1.url(CONNECT_PATH))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(reply.is_success(), "{reply:?}");
        assert_eq!(reply.connect_type, "tcp");
        let port: u16 = reply.connect_dest.parse().unwrap();

        // A second request for the live id reuses the port.
        let again = mbg1
            .router
            .handle_connect(&request, "127.0.0.1", None)
            .await;
        assert_eq!(again.status(), ConnectStatus::AlreadySetup);
        assert_eq!(again.connect_dest, reply.connect_dest);

        round_trip(port, b"explicit connect").await;
    }

    #[tokio::test]
    async fn explicit_connect_over_mtls() {
        let (mbg1, _mbg2) = pair(Dataplane::Mtls).await;
        mbg1.router
            .state()
            .catalog()
            .add_remote_service("web", "127.0.0.1", "MBG2")
            .await;

        let request = ConnectRequest {
            id: "client".into(),
            id_dest: "web".into(),
            policy: String::new(),
            mbg_id: "MBG1".into(),
        };
        let reply = mbg1.router.handle_connect(&request, "127.0.0.1", None).await;
        assert!(reply.is_success(), "{reply:?}");
        assert_eq!(reply.connect_type, "mtls");
        round_trip(reply.connect_dest.parse().unwrap(), b"explicit mtls").await;
    }

    #[tokio::test]
    async fn denied_peer_answers_forbidden() {
        let mbg2 = spawn_gateway("MBG2", Dataplane::Tcp, FixedGate::deny(), None).await;
        mbg2.router
            .state()
            .catalog()
            .add_local_service("web", "127.0.0.1:1")
            .await;

        let request = ConnectRequest {
            id: "client".into(),
            id_dest: "web".into(),
            policy: String::new(),
            mbg_id: "MBG1".into(),
        };
        let response = reqwest::Client::new()
            .post(mbg2.url(CONNECT_PATH))
            .json(&request)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let reply: ConnectReply = response.json().await.unwrap();
        assert_eq!(reply.message, "failure");
        assert!(mbg2.router.tracker().is_empty());
    }

    #[tokio::test]
    async fn connect_mode_without_upgrade_header_is_rejected() {
        let mbg2 = spawn_gateway("MBG2", Dataplane::Tcp, FixedGate::allow(), None).await;
        let response = reqwest::Client::new()
            .get(mbg2.url("/connect?id=a&idDest=web&mbgId=MBG1"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn service_and_peer_registration() {
        let gw = spawn_gateway("MBG1", Dataplane::Tcp, FixedGate::allow(), None).await;
        let http = reqwest::Client::new();

        let status = http
            .post(gw.url("/service"))
            .json(&ServiceRequest {
                id: "web".into(),
                ip: "10.0.0.5:80".into(),
            })
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);

        let services: serde_json::Value = http
            .get(gw.url("/service"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(services[0]["id"], "web");

        let missing = http.get(gw.url("/service/db")).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        http.post(gw.url("/peer"))
            .json(&PeerRequest {
                id: "MBG2".into(),
                ip: "10.0.0.9".into(),
                cport: 30443,
                dport: 30001,
            })
            .send()
            .await
            .unwrap();
        let peers: serde_json::Value = http
            .get(gw.url("/peer"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(peers[0]["id"], "MBG2");
        assert_eq!(peers[0]["control_port"], 30443);
    }

    #[tokio::test]
    async fn mtls_gateway_needs_dataplane_listener() {
        let ca = DevCa::generate("ca").unwrap();
        let state = Arc::new(GatewayState::new(
            crate::state::testing::identity("MBG1", Dataplane::Mtls),
            None,
        ));
        let router = Arc::new(
            ConnectionRouter::new(
                state,
                tracker(),
                Arc::new(FixedGate::allow()),
                Some(settings(&ca, "MBG1")),
                timeouts(),
            )
            .unwrap(),
        );
        let control = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = GatewayServer::new(router)
            .serve(control, None, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(MbgError::Config(_))));
    }
}
