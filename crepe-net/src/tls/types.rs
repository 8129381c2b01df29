use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct CaMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CaMaterialPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Root CA: the on-disk material plus the rcgen handle used to sign leaves.
pub struct CaCertificate {
    pub material: CaMaterial,
    pub cert: rcgen::Certificate,
}

impl fmt::Debug for CaCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaCertificate")
            .field("material", &self.material)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub host: String,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub not_after: DateTime<Utc>,
}

impl LeafCertificate {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsError {
    pub kind: TlsErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    Rcgen,
    Io,
    OpenSsl,
    Expired,
    InvalidHost,
}

impl TlsError {
    pub fn new(kind: TlsErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TlsError {}
