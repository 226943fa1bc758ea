//! Logical connection identifiers and port assignments.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one logical end-to-end flow: `source:dest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(source: &str, dest: &str) -> Self {
        Self(format!("{source}:{dest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A name derived from this id that no other call will ever return,
    /// e.g. `a:b-0192f3c4d5e60001a1b2c3d4e5f60718`.
    pub fn unique_name(&self) -> String {
        format!("{}-{}", self.0, unique_suffix())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

static SUFFIX_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Sortable unique suffix: 48-bit millisecond timestamp, a process-wide
/// counter, and 8 random bytes, hex encoded.
///
/// The counter makes suffixes distinct within the process even when the
/// clock does not move; the random part keeps them distinct across gateways.
pub fn unique_suffix() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let seq = SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut random = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut random);

    format!(
        "{:012x}{:08x}{}",
        millis & 0xffff_ffff_ffff,
        seq,
        hex::encode(random)
    )
}

/// Local listening port and externally advertised port reserved for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortAssignment {
    /// Tracker key (a connection id or an imported service id).
    pub connection_id: String,
    /// Port this gateway listens on.
    pub local: u16,
    /// Port advertised to the requester.
    pub external: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn connection_id_format() {
        let id = ConnectionId::new("svc-a", "svc-b");
        assert_eq!(id.as_str(), "svc-a:svc-b");
        assert_eq!(id.to_string(), "svc-a:svc-b");
    }

    #[test]
    fn unique_names_never_repeat() {
        let id = ConnectionId::new("a", "b");
        let names: HashSet<String> = (0..1000).map(|_| id.unique_name()).collect();
        assert_eq!(names.len(), 1000);
        assert!(names.iter().all(|n| n.starts_with("a:b-")));
    }

    #[test]
    fn suffix_is_hex() {
        let s = unique_suffix();
        assert_eq!(s.len(), 12 + 8 + 16);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
