use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::openssl::pem_not_after;
use super::types::{LeafCertificate, TlsError, TlsErrorKind};

/// Host-keyed leaf store with LRU eviction, remembering the directory leaves
/// are persisted to.
/// Expired entries are never returned.
#[derive(Debug)]
pub struct CertCache {
    max_entries: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Arc<LeafCertificate>>,
    disk_path: Option<PathBuf>,
}

impl CertCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
            disk_path: None,
        }
    }

    pub fn with_disk_path(max_entries: usize, path: impl AsRef<Path>) -> Self {
        Self {
            disk_path: Some(path.as_ref().to_path_buf()),
            ..Self::new(max_entries)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Directory leaves are persisted to, if any.
    pub fn disk_path(&self) -> Option<&Path> {
        self.disk_path.as_deref()
    }

    /// In-memory lookup only; disk reloads go through the authority, which
    /// checks the stored leaf against its root.
    pub fn get(&mut self, host: &str) -> Option<Arc<LeafCertificate>> {
        let cert = self.entries.get(host).cloned()?;
        if cert.is_expired() {
            self.remove(host);
            return None;
        }
        self.touch(host);
        Some(cert)
    }

    pub fn insert(&mut self, cert: Arc<LeafCertificate>) {
        let host = cert.host.clone();
        if !self.entries.contains_key(&host) {
            self.order.push_back(host.clone());
        }
        self.entries.insert(host.clone(), cert);
        self.touch(&host);
        self.evict_if_needed();
    }

    pub fn remove(&mut self, host: &str) {
        self.entries.remove(host);
        if let Some(pos) = self.order.iter().position(|item| item == host) {
            self.order.remove(pos);
        }
    }

    fn touch(&mut self, host: &str) {
        if let Some(pos) = self.order.iter().position(|item| item == host) {
            self.order.remove(pos);
            self.order.push_back(host.to_string());
        }
    }

    fn evict_if_needed(&mut self) {
        while self.order.len() > self.max_entries {
            if let Some(host) = self.order.pop_front() {
                self.entries.remove(&host);
            }
        }
    }
}

fn disk_paths(dir: &Path, host: &str) -> (PathBuf, PathBuf) {
    // Hosts come from the wire; keep them from escaping the directory.
    let name: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    (dir.join(format!("{name}.pem")), dir.join(format!("{name}.key")))
}

pub(crate) fn store_leaf(dir: &Path, cert: &LeafCertificate) -> Result<(), TlsError> {
    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    let (cert_path, key_path) = disk_paths(dir, &cert.host);
    fs::write(cert_path, &cert.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(key_path, &cert.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    Ok(())
}

pub(crate) fn load_leaf(path: &Path, host: &str) -> Result<LeafCertificate, TlsError> {
    let (cert_path, key_path) = disk_paths(path, host);
    let cert_pem =
        fs::read(cert_path).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    let key_pem =
        fs::read(key_path).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    let not_after = pem_not_after(&cert_pem)?;
    Ok(LeafCertificate {
        host: host.to_string(),
        cert_pem,
        key_pem,
        not_after,
    })
}
