//! Certificate loading and development certificate generation.
//!
//! Gateways in one fabric share a root CA; each gateway presents a leaf
//! certificate valid for both server and client authentication.

use crate::state::TlsPaths;
use mbg_core::{MbgError, MbgResult};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use tracing::info;

/// Parse every certificate in a PEM buffer.
pub fn parse_certs(pem: &[u8]) -> MbgResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MbgError::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(MbgError::Tls("no certificate found in PEM".into()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM buffer.
pub fn parse_private_key(pem: &[u8]) -> MbgResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| MbgError::Tls(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| MbgError::Tls("no private key found in PEM".into()))
}

pub fn read_pem(path: &Path) -> MbgResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| MbgError::Config(format!("cannot read {}: {e}", path.display())))
}

/// PEM-encoded certificate and its key.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Development certificate authority.
pub struct DevCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl DevCa {
    pub fn generate(name: &str) -> MbgResult<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(rcgen_err)?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        let key = KeyPair::generate().map_err(rcgen_err)?;
        let cert = params.self_signed(&key).map_err(rcgen_err)?;
        Ok(Self { cert, key })
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a gateway certificate for `gateway_id`, valid for `names`
    /// (DNS names or IP addresses).
    pub fn issue(&self, gateway_id: &str, names: &[String]) -> MbgResult<IssuedCert> {
        let mut params = CertificateParams::new(names.to_vec()).map_err(rcgen_err)?;
        params.distinguished_name.push(DnType::CommonName, gateway_id);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().map_err(rcgen_err)?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(rcgen_err)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Write a fresh CA and a certificate for `gateway_id` into `dir`.
pub fn generate_dev_certificates(
    dir: &Path,
    gateway_id: &str,
    names: &[String],
) -> MbgResult<TlsPaths> {
    std::fs::create_dir_all(dir)?;
    let ca = DevCa::generate("mbg development CA")?;
    let issued = ca.issue(gateway_id, names)?;

    let paths = TlsPaths {
        root_ca: dir.join("ca.pem"),
        cert: dir.join(format!("{gateway_id}.pem")),
        key: dir.join(format!("{gateway_id}.key")),
    };
    std::fs::write(&paths.root_ca, ca.pem())?;
    std::fs::write(&paths.cert, issued.cert_pem)?;
    std::fs::write(&paths.key, issued.key_pem)?;
    info!(dir = %dir.display(), gateway = %gateway_id, "generated development certificates");
    Ok(paths)
}

fn rcgen_err(e: rcgen::Error) -> MbgError {
    MbgError::Tls(format!("certificate generation: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_cert_parses() {
        let ca = DevCa::generate("test CA").unwrap();
        let issued = ca
            .issue("MBG1", &["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
        assert_eq!(parse_certs(ca.pem().as_bytes()).unwrap().len(), 1);
        assert_eq!(parse_certs(issued.cert_pem.as_bytes()).unwrap().len(), 1);
        assert!(parse_private_key(issued.key_pem.as_bytes()).is_ok());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_certs(b"not a pem").is_err());
        assert!(parse_private_key(b"not a pem").is_err());
    }

    #[test]
    fn writes_certificate_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths =
            generate_dev_certificates(dir.path(), "MBG1", &["localhost".to_string()]).unwrap();
        assert!(paths.root_ca.exists());
        assert!(paths.cert.exists());
        assert!(paths.key.exists());
        assert!(parse_certs(&read_pem(&paths.cert).unwrap()).is_ok());
    }
}
