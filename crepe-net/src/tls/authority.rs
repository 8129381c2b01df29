use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::cache::{CertCache, load_leaf, store_leaf};
use super::cert::generate_leaf_cert;
use super::openssl::pem_signed_by;
use super::types::{CaCertificate, CaMaterial, LeafCertificate, TlsError, TlsErrorKind};

/// Issues per-host leaf certificates signed by the root CA.
///
/// At most one generation runs per host at a time: callers racing on the same
/// uncached host wait on a per-host gate and then share the single result.
/// A failed generation is not cached, so later calls retry and other hosts are
/// unaffected.
///
/// Leaves persisted on disk are reused only while unexpired and signed by the
/// current root; anything else is reissued and overwritten.
pub struct CertificateAuthority {
    ca: Arc<CaCertificate>,
    validity_days: u32,
    cache: Mutex<CertCache>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generated: AtomicU64,
}

impl CertificateAuthority {
    pub fn new(ca: CaCertificate, cache: CertCache, validity_days: u32) -> Self {
        Self {
            ca: Arc::new(ca),
            validity_days,
            cache: Mutex::new(cache),
            inflight: Mutex::new(HashMap::new()),
            generated: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &CaMaterial {
        &self.ca.material
    }

    /// Number of leaves signed by this authority since creation.
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::SeqCst)
    }

    pub async fn get_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>, TlsError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        if let Some(cert) = self.cached(&host) {
            return Ok(cert);
        }

        let gate = self.gate(&host);
        let result = {
            let _guard = gate.lock().await;
            match self.cached(&host) {
                Some(cert) => Ok(cert),
                None => self.issue(&host).await,
            }
        };
        self.release(&host, &gate);
        result
    }

    async fn issue(&self, host: &str) -> Result<Arc<LeafCertificate>, TlsError> {
        let ca = Arc::clone(&self.ca);
        let owned_host = host.to_string();
        let validity_days = self.validity_days;
        let disk = self.lock_cache().disk_path().map(Path::to_path_buf);
        let (cert, issued) = tokio::task::spawn_blocking(move || {
            load_or_issue(&owned_host, &ca, validity_days, disk.as_deref())
        })
        .await
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))??;
        if issued {
            self.generated.fetch_add(1, Ordering::SeqCst);
            debug!(host, "issued leaf certificate");
        } else {
            debug!(host, "reloaded leaf certificate from disk");
        }

        let cert = Arc::new(cert);
        self.lock_cache().insert(Arc::clone(&cert));
        Ok(cert)
    }

    fn cached(&self, host: &str) -> Option<Arc<LeafCertificate>> {
        self.lock_cache().get(host)
    }

    fn gate(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = lock(&self.inflight);
        Arc::clone(inflight.entry(host.to_string()).or_default())
    }

    /// Drops the host's gate once no other caller holds it. Clones are only
    /// taken under the `inflight` lock, so the count cannot grow meanwhile.
    fn release(&self, host: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = lock(&self.inflight);
        let idle = inflight
            .get(host)
            .is_some_and(|current| Arc::ptr_eq(current, gate) && Arc::strong_count(current) == 2);
        if idle {
            inflight.remove(host);
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, CertCache> {
        lock(&self.cache)
    }
}

/// Runs on the blocking pool: disk reads, signing and disk writes.
fn load_or_issue(
    host: &str,
    ca: &CaCertificate,
    validity_days: u32,
    disk: Option<&Path>,
) -> Result<(LeafCertificate, bool), TlsError> {
    if let Some(dir) = disk {
        if let Ok(cert) = load_leaf(dir, host) {
            if !cert.is_expired() && signed_by_root(&cert, ca) {
                return Ok((cert, false));
            }
            debug!(host, "discarding stale leaf certificate");
        }
    }

    let cert = generate_leaf_cert(host, ca, validity_days)?;
    if let Some(dir) = disk {
        if let Err(err) = store_leaf(dir, &cert) {
            warn!(host, dir = %dir.display(), error = %err, "failed to persist leaf certificate");
        }
    }
    Ok((cert, true))
}

fn signed_by_root(cert: &LeafCertificate, ca: &CaCertificate) -> bool {
    pem_signed_by(&cert.cert_pem, &ca.material.cert_pem).unwrap_or(false)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
