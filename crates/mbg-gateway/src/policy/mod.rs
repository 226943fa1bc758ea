//! Admission gate: the policy/event hook consulted before any data path is
//! built.
//!
//! - [`AdmissionGate`] is the contract: authorize an [`AdmissionEvent`] and
//!   resolve the network-function target of a policy name.
//! - [`rules::RulePolicy`] evaluates static allow-lists from the config file.
//! - [`remote::RemotePolicyEngine`] asks an external policy engine over HTTP.
//!
//! Callers go through [`admit`] and [`resolve_policy_target`], which apply
//! the configured timeout and fold errors into Deny / "no target".

pub mod remote;
pub mod rules;

pub use remote::RemotePolicyEngine;
pub use rules::{PolicyRules, RulePolicy};

use mbg_core::{MbgError, MbgResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Decision returned by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResponse {
    pub action: Action,
}

impl PolicyResponse {
    pub fn allow() -> Self {
        Self {
            action: Action::Allow,
        }
    }

    pub fn deny() -> Self {
        Self { action: Action::Deny }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// A peer gateway asks to reach one of our services.
    Incoming,
    /// One of our services asks to reach a peer's service.
    Outgoing,
}

/// Attributes of a `NewConnectionRequest` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequestAttr {
    pub src_service: String,
    pub dst_service: String,
    pub direction: Direction,
    /// The peer gateway on the other side of the connection.
    pub other_mbg: String,
}

/// Attributes of a `NewRemoteService` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRemoteServiceAttr {
    pub service: String,
    pub mbg: String,
}

/// Something the gateway is about to do that needs a policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    NewRemoteService(NewRemoteServiceAttr),
    NewConnectionRequest(ConnectionRequestAttr),
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::NewRemoteService(a) => {
                write!(f, "new remote service {} from {}", a.service, a.mbg)
            }
            AdmissionEvent::NewConnectionRequest(a) => write!(
                f,
                "{:?} connection {}:{} via {}",
                a.direction, a.src_service, a.dst_service, a.other_mbg
            ),
        }
    }
}

pub type PolicyFuture<'a, T> = Pin<Box<dyn Future<Output = MbgResult<T>> + Send + 'a>>;

/// Pluggable policy hook.
pub trait AdmissionGate: Send + Sync {
    /// Decide whether `event` may proceed.
    fn authorize<'a>(&'a self, event: &'a AdmissionEvent) -> PolicyFuture<'a, PolicyResponse>;

    /// Address of the network function `policy` inserts on the path, if any.
    fn policy_target<'a>(&'a self, policy: &'a str) -> PolicyFuture<'a, Option<String>>;
}

/// Ask `gate` about `event`. Errors and timeouts count as Deny.
pub async fn admit(gate: &dyn AdmissionGate, event: &AdmissionEvent, timeout: Duration) -> bool {
    let result = match tokio::time::timeout(timeout, gate.authorize(event)).await {
        Ok(result) => result,
        Err(_) => Err(MbgError::Timeout),
    };
    match result {
        Ok(PolicyResponse {
            action: Action::Allow,
        }) => {
            debug!(event = %event, "admitted");
            true
        }
        Ok(PolicyResponse { action: Action::Deny }) => {
            warn!(event = %event, "denied by policy");
            false
        }
        Err(e) => {
            warn!(event = %event, error = %e, "admission check failed, denying");
            false
        }
    }
}

/// Resolve the policy target for `policy`. Errors and timeouts mean "no
/// network function"; an empty address is the same as none.
pub async fn resolve_policy_target(
    gate: &dyn AdmissionGate,
    policy: &str,
    timeout: Duration,
) -> Option<String> {
    if policy.is_empty() {
        return None;
    }
    let result = match tokio::time::timeout(timeout, gate.policy_target(policy)).await {
        Ok(result) => result,
        Err(_) => Err(MbgError::Timeout),
    };
    match result {
        Ok(target) => target.filter(|t| !t.is_empty()),
        Err(e) => {
            warn!(policy = %policy, error = %e, "policy target lookup failed, forwarding directly");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedGate;
    use super::*;

    fn event() -> AdmissionEvent {
        AdmissionEvent::NewConnectionRequest(ConnectionRequestAttr {
            src_service: "a".into(),
            dst_service: "b".into(),
            direction: Direction::Incoming,
            other_mbg: "MBG2".into(),
        })
    }

    struct SlowGate;

    impl AdmissionGate for SlowGate {
        fn authorize<'a>(&'a self, _event: &'a AdmissionEvent) -> PolicyFuture<'a, PolicyResponse> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(PolicyResponse::allow())
            })
        }

        fn policy_target<'a>(&'a self, _policy: &'a str) -> PolicyFuture<'a, Option<String>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Some("10.0.0.1:9000".into()))
            })
        }
    }

    #[tokio::test]
    async fn allow_and_deny() {
        let t = Duration::from_secs(1);
        assert!(admit(&FixedGate::allow(), &event(), t).await);
        assert!(!admit(&FixedGate::deny(), &event(), t).await);
    }

    #[tokio::test]
    async fn error_is_deny() {
        assert!(!admit(&FixedGate::broken(), &event(), Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_deny_and_no_target() {
        let t = Duration::from_millis(100);
        assert!(!admit(&SlowGate, &event(), t).await);
        assert_eq!(resolve_policy_target(&SlowGate, "split", t).await, None);
    }

    #[tokio::test]
    async fn empty_target_means_direct() {
        let mut gate = FixedGate::allow();
        gate.target = Some(String::new());
        let t = Duration::from_secs(1);
        assert_eq!(resolve_policy_target(&gate, "forward", t).await, None);
        gate.target = Some("10.0.0.9:5000".into());
        assert_eq!(
            resolve_policy_target(&gate, "forward", t).await.as_deref(),
            Some("10.0.0.9:5000")
        );
        assert_eq!(resolve_policy_target(&gate, "", t).await, None);
    }

    #[test]
    fn connection_attr_wire_names() {
        let json = serde_json::to_value(ConnectionRequestAttr {
            src_service: "a".into(),
            dst_service: "b".into(),
            direction: Direction::Outgoing,
            other_mbg: "MBG1".into(),
        })
        .unwrap();
        assert_eq!(json["srcService"], "a");
        assert_eq!(json["direction"], "outgoing");
        assert_eq!(json["otherMbg"], "MBG1");
    }
}
