use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load root CA: {0}")]
    RootCa(String),
    #[error("TLS handshake with {peer} failed: {message}")]
    Handshake { peer: String, message: String },
    #[error("cannot evaluate rules for host {host:?}: {reason}")]
    RuleEvaluation { host: String, reason: String },
    #[error("upstream {host}:{port} unreachable: {reason}")]
    UpstreamUnreachable {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("certificate generation for {host} failed: {message}")]
    CertificateGeneration { host: String, message: String },
    #[error("configuration is locked while the proxy is running; stop it first")]
    ConfigLocked,
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("protocol error from {peer}: {message}")]
    Protocol { peer: SocketAddr, message: String },
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Errors that abort the whole server rather than a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Bind { .. } | ProxyError::RootCa(_))
    }

    /// Status line for the synthetic response sent to the client, if any.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            ProxyError::UpstreamUnreachable { .. } | ProxyError::Handshake { .. } => {
                Some((502, "Bad Gateway"))
            }
            ProxyError::CertificateGeneration { .. } => Some((502, "Bad Gateway")),
            ProxyError::Protocol { .. } | ProxyError::RuleEvaluation { .. } => {
                Some((400, "Bad Request"))
            }
            _ => None,
        }
    }
}
