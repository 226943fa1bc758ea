//! Port/connection tracker.
//!
//! Every active forwarder is recorded here under a key (a connection id, an
//! imported service id, or a per-connection unique name) together with the
//! cancellation token that tears it down and, when the path needs one, a
//! local/external port pair.
//!
//! A key has at most one entry at any instant: allocating or tracking a key
//! that is still live fails with [`MbgError::AlreadySetup`]. Entries are
//! owned by a [`ConnectionLease`] that the forwarder task holds; the entry
//! (and its ports) is freed when the lease drops, i.e. when the task ends.

use mbg_core::{MbgError, MbgResult, PortAssignment};
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Half-open port range `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    fn len(&self) -> usize {
        self.as_range().len()
    }

    fn as_range(&self) -> Range<u16> {
        self.start..self.end.max(self.start)
    }
}

struct TrackedEntry {
    ports: Option<PortAssignment>,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct TrackerInner {
    entries: HashMap<String, TrackedEntry>,
    next_generation: u64,
}

/// A live tracker entry as reported by [`PortTracker::connections`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedConnection {
    pub key: String,
    pub ports: Option<PortAssignment>,
}

/// Thread-safe registry of active connections and their ports.
pub struct PortTracker {
    inner: Arc<Mutex<TrackerInner>>,
    local_range: PortRange,
    external_range: PortRange,
}

impl PortTracker {
    /// Create a tracker drawing local ports from `local_range` and advertised
    /// ports from `external_range`.
    ///
    /// When both ranges are equal the gateway is reachable directly and the
    /// external port of an assignment is its local port.
    pub fn new(local_range: PortRange, external_range: PortRange) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner::default())),
            local_range,
            external_range,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a local/external port pair for `key`.
    ///
    /// # Errors
    ///
    /// [`MbgError::AlreadySetup`] if `key` is live, [`MbgError::PortsExhausted`]
    /// if either range has no usable port left.
    pub fn allocate(&self, key: &str) -> MbgResult<ConnectionLease> {
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            return Err(MbgError::AlreadySetup(key.to_string()));
        }

        let used_local: HashSet<u16> = inner
            .entries
            .values()
            .filter_map(|e| e.ports.as_ref().map(|p| p.local))
            .collect();
        let local = pick_port(self.local_range, &used_local, port_is_bindable).ok_or_else(|| {
            MbgError::PortsExhausted(format!(
                "local range {}..{}",
                self.local_range.start, self.local_range.end
            ))
        })?;

        let external = if self.local_range == self.external_range {
            local
        } else {
            let used_external: HashSet<u16> = inner
                .entries
                .values()
                .filter_map(|e| e.ports.as_ref().map(|p| p.external))
                .collect();
            pick_port(self.external_range, &used_external, |_| true).ok_or_else(|| {
                MbgError::PortsExhausted(format!(
                    "external range {}..{}",
                    self.external_range.start, self.external_range.end
                ))
            })?
        };

        let ports = PortAssignment {
            connection_id: key.to_string(),
            local,
            external,
        };
        let lease = Self::insert(&self.inner, &mut inner, key, Some(ports));
        info!(key = %key, local, external, "ports allocated");
        Ok(lease)
    }

    /// Record a forwarder for `key` without reserving ports.
    pub fn track(&self, key: &str) -> MbgResult<ConnectionLease> {
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            return Err(MbgError::AlreadySetup(key.to_string()));
        }
        let lease = Self::insert(&self.inner, &mut inner, key, None);
        debug!(key = %key, "connection tracked");
        Ok(lease)
    }

    fn insert(
        shared: &Arc<Mutex<TrackerInner>>,
        inner: &mut TrackerInner,
        key: &str,
        ports: Option<PortAssignment>,
    ) -> ConnectionLease {
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let cancel = CancellationToken::new();
        inner.entries.insert(
            key.to_string(),
            TrackedEntry {
                ports: ports.clone(),
                cancel: cancel.clone(),
                generation,
            },
        );
        ConnectionLease {
            key: key.to_string(),
            generation,
            ports,
            cancel,
            tracker: Arc::clone(shared),
        }
    }

    /// Port assignment currently recorded for `key`.
    pub fn assignment(&self, key: &str) -> Option<PortAssignment> {
        self.lock().entries.get(key).and_then(|e| e.ports.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries, sorted by key.
    pub fn connections(&self) -> Vec<TrackedConnection> {
        let mut all: Vec<_> = self
            .lock()
            .entries
            .iter()
            .map(|(key, e)| TrackedConnection {
                key: key.clone(),
                ports: e.ports.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Cancel the forwarder behind `key` and free its entry.
    ///
    /// Returns `false` if `key` was not live.
    pub fn release(&self, key: &str) -> bool {
        let removed = self.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!(key = %key, "connection released");
                true
            }
            None => false,
        }
    }
}

/// Pick a random unused port from `range`, scanning forward from a random
/// offset so every port is considered once.
fn pick_port(range: PortRange, used: &HashSet<u16>, usable: impl Fn(u16) -> bool) -> Option<u16> {
    let len = range.len();
    if len == 0 {
        return None;
    }
    let offset = rand::thread_rng().gen_range(0..len);
    (0..len)
        .map(|i| range.start + ((offset + i) % len) as u16)
        .find(|port| !used.contains(port) && usable(*port))
}

fn port_is_bindable(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Ownership of one tracker entry. Dropping it frees the entry.
pub struct ConnectionLease {
    key: String,
    generation: u64,
    ports: Option<PortAssignment>,
    cancel: CancellationToken,
    tracker: Arc<Mutex<TrackerInner>>,
}

impl ConnectionLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ports(&self) -> Option<&PortAssignment> {
        self.ports.as_ref()
    }

    /// Token cancelled by [`PortTracker::release`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("key", &self.key)
            .field("ports", &self.ports)
            .finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        let mut inner = self
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A released key may already belong to a newer lease.
        if inner
            .entries
            .get(&self.key)
            .is_some_and(|e| e.generation == self.generation)
        {
            inner.entries.remove(&self.key);
            debug!(key = %self.key, "connection entry freed");
        }
    }
}
