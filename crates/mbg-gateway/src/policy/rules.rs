//! Static admission rules loaded from the `[policy]` config section.
//!
//! The rules are split into two types:
//!
//! - [`PolicyRules`]: a plain configuration struct (cloneable, deserializable)
//!   that holds the allow-lists and the policy target table.
//! - [`RulePolicy`]: the runtime counterpart implementing [`AdmissionGate`],
//!   with the allow-lists pre-computed into sets.

use super::{AdmissionEvent, AdmissionGate, PolicyFuture, PolicyResponse};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Static admission configuration.
///
/// # Connection Matching
///
/// `allowed_connections` supports three forms:
///
/// | Pattern           | Matches                                        |
/// |-------------------|------------------------------------------------|
/// | `"*"`             | Any source and destination (wildcard).          |
/// | `"client"`        | Source service `client` to **any** destination. |
/// | `"client:server"` | Exactly the `client` → `server` pair.           |
///
/// `allowed_peers` is `"*"` or a list of peer gateway ids whose service
/// exposures are accepted. Empty lists allow nothing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyRules {
    pub allowed_connections: Vec<String>,
    pub allowed_peers: Vec<String>,
    /// Policy name to network-function address.
    pub policy_targets: HashMap<String, String>,
}

/// Default rules: allow every connection and every peer, no network functions.
impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            allowed_connections: vec!["*".to_string()],
            allowed_peers: vec!["*".to_string()],
            policy_targets: HashMap::new(),
        }
    }
}

/// [`AdmissionGate`] backed by [`PolicyRules`].
pub struct RulePolicy {
    connections: HashSet<String>,
    allow_all_connections: bool,
    peers: HashSet<String>,
    allow_all_peers: bool,
    targets: HashMap<String, String>,
}

impl RulePolicy {
    pub fn new(rules: PolicyRules) -> Self {
        let allow_all_connections = rules.allowed_connections.iter().any(|p| p == "*");
        let allow_all_peers = rules.allowed_peers.iter().any(|p| p == "*");
        Self {
            connections: rules.allowed_connections.into_iter().collect(),
            allow_all_connections,
            peers: rules.allowed_peers.into_iter().collect(),
            allow_all_peers,
            targets: rules.policy_targets,
        }
    }

    fn check(&self, event: &AdmissionEvent) -> PolicyResponse {
        let allowed = match event {
            AdmissionEvent::NewConnectionRequest(attr) => {
                self.allow_all_connections
                    || self.connections.contains(&attr.src_service)
                    || self
                        .connections
                        .contains(&format!("{}:{}", attr.src_service, attr.dst_service))
            }
            AdmissionEvent::NewRemoteService(attr) => {
                self.allow_all_peers || self.peers.contains(&attr.mbg)
            }
        };
        if allowed {
            PolicyResponse::allow()
        } else {
            PolicyResponse::deny()
        }
    }
}

impl AdmissionGate for RulePolicy {
    fn authorize<'a>(&'a self, event: &'a AdmissionEvent) -> PolicyFuture<'a, PolicyResponse> {
        let decision = self.check(event);
        Box::pin(async move { Ok(decision) })
    }

    fn policy_target<'a>(&'a self, policy: &'a str) -> PolicyFuture<'a, Option<String>> {
        let target = self.targets.get(policy).cloned();
        Box::pin(async move { Ok(target) })
    }
}
