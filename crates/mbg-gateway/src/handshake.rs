//! Control-plane client used to negotiate with peer gateways.
//!
//! Two variants of the connect request exist:
//!
//! - [`PeerClient::request_connect`]: `POST /connect` with a JSON body,
//!   answered by a JSON [`ConnectReply`]. Used by the mTLS data plane, where
//!   the reply names the endpoint to dial.
//! - [`PeerClient::request_connect_upgrade`]: `GET /connect?...` with
//!   `Connection: upgrade`. On `101 Switching Protocols` the control
//!   connection itself becomes the data path (connect mode).
//!
//! Every call is bounded by the handshake timeout.

use crate::dataplane::BoxedStream;
use mbg_core::messages::{
    ConnectReply, ConnectRequest, ConnectStatus, ExposeRequest, CONNECT_PATH, CONNECT_UPGRADE,
};
use mbg_core::{Dataplane, MbgError, MbgResult};
use reqwest::header::{CONNECTION, UPGRADE};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

pub const EXPOSE_PATH: &str = "/expose";

pub struct PeerClient {
    my_id: String,
    addr_start: String,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl PeerClient {
    /// `addr_start` is the URL scheme prefix (`http://`), `timeout` bounds
    /// each request.
    pub fn new(my_id: &str, addr_start: &str, timeout: Duration) -> MbgResult<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| MbgError::Config(format!("control-plane client: {e}")))?;
        Ok(Self {
            my_id: my_id.to_string(),
            addr_start: addr_start.to_string(),
            timeout,
            http_client,
        })
    }

    fn url(&self, peer: &str, path: &str) -> String {
        format!("{}{}{}", self.addr_start, peer, path)
    }

    fn connect_request(&self, src: &str, dst: &str, policy: &str) -> ConnectRequest {
        ConnectRequest {
            id: src.to_string(),
            id_dest: dst.to_string(),
            policy: policy.to_string(),
            mbg_id: self.my_id.clone(),
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = MbgResult<T>>) -> MbgResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| MbgError::Timeout)?
    }

    /// Ask the gateway at `peer` (control address) to set up `src → dst`.
    /// Returns the data plane and target named in the reply.
    pub async fn request_connect(
        &self,
        src: &str,
        dst: &str,
        policy: &str,
        peer: &str,
    ) -> MbgResult<(Dataplane, String)> {
        let request = self.connect_request(src, dst, policy);
        let url = self.url(peer, CONNECT_PATH);
        info!(url = %url, src = %src, dst = %dst, "sending connect request");

        let reply = self
            .bounded(async {
                let response = self
                    .http_client
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| MbgError::Handshake(format!("{url}: {e}")))?;
                read_reply(response).await
            })
            .await?;
        classify(reply)
    }

    /// Connect-mode handshake: on success the returned stream is the data
    /// path to `dst`.
    pub async fn request_connect_upgrade(
        &self,
        src: &str,
        dst: &str,
        policy: &str,
        peer: &str,
    ) -> MbgResult<BoxedStream> {
        let request = self.connect_request(src, dst, policy);
        let url = self.url(peer, CONNECT_PATH);
        info!(url = %url, src = %src, dst = %dst, "sending connect-mode request");

        self.bounded(async {
            let response = self
                .http_client
                .get(&url)
                .query(&request)
                .header(CONNECTION, "upgrade")
                .header(UPGRADE, CONNECT_UPGRADE)
                .send()
                .await
                .map_err(|e| MbgError::Handshake(format!("{url}: {e}")))?;

            if response.status() != StatusCode::SWITCHING_PROTOCOLS {
                let reply = read_reply(response).await?;
                return classify(reply).and_then(|(_, target)| {
                    Err(MbgError::Handshake(format!(
                        "peer answered {target} without switching protocols"
                    )))
                });
            }
            let upgraded = response
                .upgrade()
                .await
                .map_err(|e| MbgError::Handshake(format!("upgrade failed: {e}")))?;
            debug!(url = %url, "control connection upgraded");
            Ok(Box::new(upgraded) as BoxedStream)
        })
        .await
    }

    /// Announce a local service to the gateway at `peer`.
    pub async fn expose(&self, peer: &str, request: &ExposeRequest) -> MbgResult<()> {
        let url = self.url(peer, EXPOSE_PATH);
        debug!(url = %url, service = %request.id, "exposing service");
        self.bounded(async {
            let response = self
                .http_client
                .post(&url)
                .json(request)
                .send()
                .await
                .map_err(|e| MbgError::Handshake(format!("{url}: {e}")))?;
            if !response.status().is_success() {
                return Err(MbgError::Handshake(format!(
                    "expose {} to {peer}: {}",
                    request.id,
                    response.status()
                )));
            }
            Ok(())
        })
        .await
    }
}

async fn read_reply(response: reqwest::Response) -> MbgResult<ConnectReply> {
    let status = response.status();
    response
        .json::<ConnectReply>()
        .await
        .map_err(|e| MbgError::Handshake(format!("unreadable connect reply ({status}): {e}")))
}

/// Map a peer's reply onto the outcome of the handshake.
fn classify(reply: ConnectReply) -> MbgResult<(Dataplane, String)> {
    match reply.status() {
        ConnectStatus::Success => {
            let dataplane = reply.connect_type.parse::<Dataplane>()?;
            Ok((dataplane, reply.connect_dest))
        }
        ConnectStatus::AlreadySetup => Err(MbgError::AlreadySetup(reply.connect_dest)),
        ConnectStatus::Failure => Err(MbgError::Handshake(reply.message)),
    }
}
