//! Gateway configuration: TOML file + CLI overrides.
//!
//! ```toml
//! [gateway]
//! id = "MBG1"
//! ip = "10.0.0.1"
//! control_port = 8443
//! dataplane_port = 8444
//! dataplane = "mtls"
//!
//! [tls]
//! root_ca = "~/.mbg/certs/ca.pem"
//! cert = "~/.mbg/certs/MBG1.pem"
//! key = "~/.mbg/certs/MBG1.key"
//!
//! [ports]
//! local = { start = 5000, end = 5100 }
//! external = { start = 30000, end = 30100 }
//!
//! [policy]
//! allowed_connections = ["*"]
//! allowed_peers = ["MBG2"]
//!
//! [[peers]]
//! id = "MBG2"
//! ip = "10.0.0.2"
//! cport = 8443
//! dport = 8444
//!
//! [[services]]
//! id = "web"
//! ip = "127.0.0.1:8080"
//! ```

use crate::policy::rules::PolicyRules;
use crate::router::Timeouts;
use crate::state::{GatewayIdentity, PeerGateway, PortRange, TlsPaths};
use mbg_core::messages::{PeerRequest, ServiceRequest};
use mbg_core::{Dataplane, MbgError, MbgResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub ports: PortsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub peers: Vec<PeerRequest>,
    #[serde(default)]
    pub services: Vec<ServiceRequest>,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_dataplane_port")]
    pub dataplane_port: u16,
    #[serde(default = "default_dataplane")]
    pub dataplane: String,
    #[serde(default = "default_addr_start")]
    pub addr_start: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            id: default_id(),
            ip: default_ip(),
            control_port: default_control_port(),
            dataplane_port: default_dataplane_port(),
            dataplane: default_dataplane(),
            addr_start: default_addr_start(),
        }
    }
}

/// `[tls]` section. Required (all three paths) for the mTLS data plane.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    pub root_ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// `[ports]` section: where local listeners and advertised ports come from.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsSection {
    #[serde(default = "default_local_ports")]
    pub local: PortRange,
    #[serde(default = "default_external_ports")]
    pub external: PortRange,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            local: default_local_ports(),
            external: default_external_ports(),
        }
    }
}

/// `[timeouts]` section, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub admission: u64,
    pub handshake: u64,
    pub receiver_wait: u64,
    pub dial: u64,
}

impl TimeoutsSection {
    /// Every bound must be at least one second.
    fn validate(&self) -> MbgResult<()> {
        for (name, secs) in [
            ("admission", self.admission),
            ("handshake", self.handshake),
            ("receiver_wait", self.receiver_wait),
            ("dial", self.dial),
        ] {
            if secs == 0 {
                return Err(MbgError::Config(format!("timeouts.{name} must be positive")));
            }
        }
        Ok(())
    }
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        let t = Timeouts::default();
        Self {
            admission: t.admission.as_secs(),
            handshake: t.handshake.as_secs(),
            receiver_wait: t.receiver_wait.as_secs(),
            dial: t.dial.as_secs(),
        }
    }
}

impl From<&TimeoutsSection> for Timeouts {
    fn from(section: &TimeoutsSection) -> Self {
        Self {
            admission: Duration::from_secs(section.admission),
            handshake: Duration::from_secs(section.handshake),
            receiver_wait: Duration::from_secs(section.receiver_wait),
            dial: Duration::from_secs(section.dial),
        }
    }
}

/// `[policy]` section: an external engine, or static rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySection {
    /// Base URL of an external policy engine. Overrides the static rules.
    pub engine_url: Option<String>,
    #[serde(flatten)]
    pub rules: PolicyRules,
}

fn default_id() -> String {
    "MBG1".to_string()
}
fn default_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    8443
}
fn default_dataplane_port() -> u16 {
    8444
}
fn default_dataplane() -> String {
    "tcp".to_string()
}
fn default_addr_start() -> String {
    "http://".to_string()
}
fn default_local_ports() -> PortRange {
    PortRange::new(5000, 5100)
}
fn default_external_ports() -> PortRange {
    PortRange::new(30000, 30100)
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub id: Option<String>,
    pub ip: Option<String>,
    pub control_port: Option<u16>,
    pub dataplane_port: Option<u16>,
    pub dataplane: Option<String>,
    pub root_ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub identity: GatewayIdentity,
    pub tls: Option<TlsPaths>,
    pub local_ports: PortRange,
    pub external_ports: PortRange,
    pub timeouts: Timeouts,
    pub policy_engine: Option<String>,
    pub policy_rules: PolicyRules,
    pub peers: Vec<PeerGateway>,
    pub services: Vec<ServiceRequest>,
}

impl ConfigFile {
    /// Read a TOML file without validating it. A missing file means defaults.
    pub fn load(config_path: Option<&Path>) -> MbgResult<Self> {
        match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                parse(&content)
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Gateway id and subject names for a development certificate.
    pub fn certificate_subject(&self, overrides: &Overrides) -> (String, Vec<String>) {
        let id = overrides.id.clone().unwrap_or_else(|| self.gateway.id.clone());
        let ip = overrides.ip.clone().unwrap_or_else(|| self.gateway.ip.clone());
        let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        for name in [id.clone(), ip] {
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        (id, names)
    }
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file means defaults.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> MbgResult<Self> {
        Self::resolve(ConfigFile::load(config_path)?, overrides)
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> MbgResult<Self> {
        let gateway = file.gateway;
        let dataplane: Dataplane = overrides
            .dataplane
            .as_deref()
            .unwrap_or(&gateway.dataplane)
            .parse()?;

        let tls = tls_paths(
            overrides.root_ca.or(file.tls.root_ca),
            overrides.cert.or(file.tls.cert),
            overrides.key.or(file.tls.key),
        )?;
        if dataplane == Dataplane::Mtls && tls.is_none() {
            return Err(MbgError::Config(
                "the mtls data plane needs [tls] root_ca, cert and key".into(),
            ));
        }

        file.timeouts.validate()?;
        for (name, range) in [("local", file.ports.local), ("external", file.ports.external)] {
            if range.start >= range.end {
                return Err(MbgError::Config(format!(
                    "{name} port range {}..{} is empty",
                    range.start, range.end
                )));
            }
        }

        let identity = GatewayIdentity {
            id: overrides.id.unwrap_or(gateway.id),
            ip: overrides.ip.unwrap_or(gateway.ip),
            control_port: overrides.control_port.unwrap_or(gateway.control_port),
            dataplane_port: overrides.dataplane_port.unwrap_or(gateway.dataplane_port),
            dataplane,
            addr_start: gateway.addr_start,
        };
        if identity.id.is_empty() {
            return Err(MbgError::Config("gateway id must not be empty".into()));
        }

        let peers = file
            .peers
            .into_iter()
            .map(|p| PeerGateway {
                id: p.id,
                ip: p.ip,
                control_port: p.cport,
                dataplane_port: p.dport,
            })
            .collect();

        Ok(Self {
            identity,
            tls,
            local_ports: file.ports.local,
            external_ports: file.ports.external,
            timeouts: Timeouts::from(&file.timeouts),
            policy_engine: file.policy.engine_url.filter(|u| !u.is_empty()),
            policy_rules: file.policy.rules,
            peers,
            services: file.services,
        })
    }
}

fn parse(content: &str) -> MbgResult<ConfigFile> {
    toml::from_str(content).map_err(|e| MbgError::Config(format!("config parse error: {e}")))
}

fn tls_paths(
    root_ca: Option<String>,
    cert: Option<String>,
    key: Option<String>,
) -> MbgResult<Option<TlsPaths>> {
    match (root_ca, cert, key) {
        (Some(root_ca), Some(cert), Some(key)) => Ok(Some(TlsPaths {
            root_ca: expand_tilde_str(&root_ca),
            cert: expand_tilde_str(&cert),
            key: expand_tilde_str(&key),
        })),
        (None, None, None) => Ok(None),
        _ => Err(MbgError::Config(
            "root_ca, cert and key must be given together".into(),
        )),
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = GatewayConfig::load(None, Overrides::default()).unwrap();
        assert_eq!(cfg.identity.id, "MBG1");
        assert_eq!(cfg.identity.control_port, 8443);
        assert_eq!(cfg.identity.dataplane, Dataplane::Tcp);
        assert_eq!(cfg.identity.addr_start, "http://");
        assert_eq!(cfg.local_ports, PortRange::new(5000, 5100));
        assert_eq!(cfg.timeouts.receiver_wait, Duration::from_secs(30));
        assert!(cfg.tls.is_none());
        assert!(cfg.policy_engine.is_none());
        assert_eq!(cfg.policy_rules.allowed_connections, vec!["*"]);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GatewayConfig::load(Some(&dir.path().join("nope.toml")), Overrides::default())
            .unwrap();
        assert_eq!(cfg.identity.dataplane_port, 8444);
    }

    #[test]
    fn full_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[gateway]
id = "MBG2"
ip = "10.0.0.2"
dataplane = "mtls"

[tls]
root_ca = "/etc/mbg/ca.pem"
cert = "/etc/mbg/mbg2.pem"
key = "/etc/mbg/mbg2.key"

[ports]
local = { start = 6000, end = 6010 }

[timeouts]
handshake = 3

[policy]
allowed_connections = ["client:web"]
allowed_peers = ["MBG1"]
policy_targets = { inspect = "10.0.0.9:7000" }

[[peers]]
id = "MBG1"
ip = "10.0.0.1"
cport = 8443
dport = 8444

[[services]]
id = "web"
ip = "127.0.0.1:8080"
"#,
        )
        .unwrap();

        let cfg = GatewayConfig::load(Some(&path), Overrides::default()).unwrap();
        assert_eq!(cfg.identity.id, "MBG2");
        assert_eq!(cfg.identity.dataplane, Dataplane::Mtls);
        assert_eq!(
            cfg.tls.as_ref().unwrap().root_ca,
            PathBuf::from("/etc/mbg/ca.pem")
        );
        assert_eq!(cfg.local_ports, PortRange::new(6000, 6010));
        assert_eq!(cfg.external_ports, PortRange::new(30000, 30100));
        assert_eq!(cfg.timeouts.handshake, Duration::from_secs(3));
        assert_eq!(cfg.timeouts.dial, Duration::from_secs(10));
        assert_eq!(cfg.policy_rules.allowed_peers, vec!["MBG1"]);
        assert_eq!(cfg.policy_rules.policy_targets["inspect"], "10.0.0.9:7000");
        assert_eq!(cfg.peers[0].control_target(), "10.0.0.1:8443");
        assert_eq!(cfg.services[0].id, "web");
    }

    #[test]
    fn cli_overrides_win() {
        let file = parse("[gateway]\nid = \"MBG2\"\ncontrol_port = 9000\n").unwrap();
        let cfg = GatewayConfig::resolve(
            file,
            Overrides {
                id: Some("MBG3".into()),
                control_port: Some(9100),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.identity.id, "MBG3");
        assert_eq!(cfg.identity.control_port, 9100);
    }

    #[test]
    fn mtls_without_certificates_is_rejected() {
        let result = GatewayConfig::resolve(
            ConfigFile::default(),
            Overrides {
                dataplane: Some("mtls".into()),
                ..Overrides::default()
            },
        );
        assert!(matches!(result, Err(MbgError::Config(_))));
    }

    #[test]
    fn partial_tls_section_is_rejected() {
        let file = parse("[tls]\ncert = \"a.pem\"\n").unwrap();
        assert!(GatewayConfig::resolve(file, Overrides::default()).is_err());
    }

    #[test]
    fn unknown_dataplane_is_rejected() {
        let file = parse("[gateway]\ndataplane = \"quic\"\n").unwrap();
        assert!(matches!(
            GatewayConfig::resolve(file, Overrides::default()),
            Err(MbgError::UnsupportedDataplane(_))
        ));
    }

    #[test]
    fn empty_port_range_is_rejected() {
        let file = parse("[ports]\nexternal = { start = 100, end = 100 }\n").unwrap();
        assert!(GatewayConfig::resolve(file, Overrides::default()).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let file = parse("[timeouts]\nreceiver_wait = 0\n").unwrap();
        let err = GatewayConfig::resolve(file, Overrides::default()).unwrap_err();
        assert!(matches!(&err, MbgError::Config(msg) if msg.contains("receiver_wait")));
    }

    #[test]
    fn certificate_subject_needs_no_tls_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway]\nid = \"MBG2\"\nip = \"10.0.0.2\"\ndataplane = \"mtls\"\n")
            .unwrap();

        let file = ConfigFile::load(Some(&path)).unwrap();
        let (id, names) = file.certificate_subject(&Overrides::default());
        assert_eq!(id, "MBG2");
        assert_eq!(names, vec!["localhost", "127.0.0.1", "MBG2", "10.0.0.2"]);

        let overrides = Overrides {
            ip: Some("127.0.0.1".into()),
            ..Overrides::default()
        };
        assert_eq!(file.certificate_subject(&overrides).1.len(), 3);

        assert!(GatewayConfig::resolve(file, Overrides::default()).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/ca.pem"), home.join("x/ca.pem"));
        }
        assert_eq!(expand_tilde_str("/abs/ca.pem"), PathBuf::from("/abs/ca.pem"));
    }
}
