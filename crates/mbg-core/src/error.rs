use thiserror::Error;

/// Errors produced by the gateway control and data planes.
#[derive(Debug, Error)]
pub enum MbgError {
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    /// The connection is already set up. Callers treat this as recoverable.
    #[error("connection already setup: {0}")]
    AlreadySetup(String),

    #[error("no free ports in {0}")]
    PortsExhausted(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("peer gateway not found: {0}")]
    PeerNotFound(String),

    #[error("unsupported dataplane: {0}")]
    UnsupportedDataplane(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl MbgError {
    /// Whether this is the recoverable "already setup" outcome.
    pub fn is_already_setup(&self) -> bool {
        matches!(self, MbgError::AlreadySetup(_))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for MbgError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        MbgError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for MbgError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        MbgError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for MbgError {
    fn from(e: serde_json::Error) -> Self {
        MbgError::Codec(e.to_string())
    }
}

pub type MbgResult<T> = Result<T, MbgError>;
