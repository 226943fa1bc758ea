//! Admission gate backed by an external policy engine reachable over HTTP.
//!
//! Events are posted as JSON and answered with `{"action": "allow"|"deny"}`:
//!
//! - `POST {url}/newConnectionRequest` with [`ConnectionRequestAttr`](super::ConnectionRequestAttr)
//! - `POST {url}/newRemoteService` with [`NewRemoteServiceAttr`](super::NewRemoteServiceAttr)
//! - `GET {url}/policyTarget?name=<policy>` answered with `{"target": "..."}`

use super::{AdmissionEvent, AdmissionGate, PolicyFuture, PolicyResponse};
use mbg_core::{MbgError, MbgResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const NEW_CONNECTION_PATH: &str = "/newConnectionRequest";
pub const NEW_REMOTE_SERVICE_PATH: &str = "/newRemoteService";
pub const POLICY_TARGET_PATH: &str = "/policyTarget";

/// Body of a `/policyTarget` reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyTargetReply {
    #[serde(default)]
    pub target: String,
}

pub struct RemotePolicyEngine {
    /// Base URL, e.g. `http://policy-engine:9990/policy`.
    base_url: String,
    http_client: reqwest::Client,
}

impl RemotePolicyEngine {
    pub fn new(base_url: &str, timeout: Duration) -> MbgResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MbgError::Config(format!("policy engine client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_event<T: Serialize + ?Sized>(&self, path: &str, attrs: &T) -> MbgResult<PolicyResponse> {
        let url = self.url(path);
        debug!(url = %url, "raising policy event");
        let response = self
            .http_client
            .post(&url)
            .json(attrs)
            .send()
            .await
            .map_err(|e| MbgError::Other(format!("policy engine unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(MbgError::Other(format!(
                "policy engine returned {}",
                response.status()
            )));
        }
        response
            .json::<PolicyResponse>()
            .await
            .map_err(|e| MbgError::Codec(format!("policy engine reply: {e}")))
    }

    async fn fetch_target(&self, policy: &str) -> MbgResult<Option<String>> {
        let response = self
            .http_client
            .get(self.url(POLICY_TARGET_PATH))
            .query(&[("name", policy)])
            .send()
            .await
            .map_err(|e| MbgError::Other(format!("policy engine unreachable: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(MbgError::Other(format!(
                "policy engine returned {}",
                response.status()
            )));
        }
        let reply = response
            .json::<PolicyTargetReply>()
            .await
            .map_err(|e| MbgError::Codec(format!("policy target reply: {e}")))?;
        Ok(Some(reply.target).filter(|t| !t.is_empty()))
    }
}

impl AdmissionGate for RemotePolicyEngine {
    fn authorize<'a>(&'a self, event: &'a AdmissionEvent) -> PolicyFuture<'a, PolicyResponse> {
        Box::pin(async move {
            match event {
                AdmissionEvent::NewConnectionRequest(attr) => {
                    self.post_event(NEW_CONNECTION_PATH, attr).await
                }
                AdmissionEvent::NewRemoteService(attr) => {
                    self.post_event(NEW_REMOTE_SERVICE_PATH, attr).await
                }
            }
        })
    }

    fn policy_target<'a>(&'a self, policy: &'a str) -> PolicyFuture<'a, Option<String>> {
        Box::pin(self.fetch_target(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Action, ConnectionRequestAttr, Direction, NewRemoteServiceAttr};
    use super::*;
    use axum::extract::Query;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn spawn_engine() -> String {
        async fn connection(Json(attr): Json<ConnectionRequestAttr>) -> Json<PolicyResponse> {
            if attr.src_service == "intruder" {
                Json(PolicyResponse::deny())
            } else {
                Json(PolicyResponse::allow())
            }
        }
        async fn remote_service(Json(_attr): Json<NewRemoteServiceAttr>) -> Json<PolicyResponse> {
            Json(PolicyResponse::deny())
        }
        async fn target(Query(q): Query<HashMap<String, String>>) -> Json<PolicyTargetReply> {
            let target = match q.get("name").map(String::as_str) {
                Some("tcp-split") => "10.0.0.20:5300".to_string(),
                _ => String::new(),
            };
            Json(PolicyTargetReply { target })
        }

        let app = Router::new()
            .route(NEW_CONNECTION_PATH, post(connection))
            .route(NEW_REMOTE_SERVICE_PATH, post(remote_service))
            .route(POLICY_TARGET_PATH, get(target));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn connect(src: &str) -> AdmissionEvent {
        AdmissionEvent::NewConnectionRequest(ConnectionRequestAttr {
            src_service: src.into(),
            dst_service: "web".into(),
            direction: Direction::Outgoing,
            other_mbg: "MBG2".into(),
        })
    }

    #[tokio::test]
    async fn decisions_from_engine() {
        let url = spawn_engine().await;
        let engine = RemotePolicyEngine::new(&url, Duration::from_secs(5)).unwrap();

        assert_eq!(engine.authorize(&connect("client")).await.unwrap().action, Action::Allow);
        assert_eq!(engine.authorize(&connect("intruder")).await.unwrap().action, Action::Deny);

        let expose = AdmissionEvent::NewRemoteService(NewRemoteServiceAttr {
            service: "web".into(),
            mbg: "MBG2".into(),
        });
        assert_eq!(engine.authorize(&expose).await.unwrap().action, Action::Deny);
    }

    #[tokio::test]
    async fn targets_from_engine() {
        let url = spawn_engine().await;
        let engine = RemotePolicyEngine::new(&format!("{url}/"), Duration::from_secs(5)).unwrap();
        assert_eq!(
            engine.policy_target("tcp-split").await.unwrap().as_deref(),
            Some("10.0.0.20:5300")
        );
        assert_eq!(engine.policy_target("forward").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_engine_is_error() {
        // Bind and drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let engine =
            RemotePolicyEngine::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        assert!(engine.authorize(&connect("client")).await.is_err());
    }
}
