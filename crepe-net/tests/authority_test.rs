use std::sync::Arc;

use assert_matches::assert_matches;
use crepe_net::{CertCache, CertificateAuthority, TlsErrorKind, generate_ca, pem_signed_by};

fn authority(cache: CertCache) -> Arc<CertificateAuthority> {
    let ca = generate_ca("Test CA").unwrap();
    Arc::new(CertificateAuthority::new(ca, cache, 365))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_generate_once() {
    let authority = authority(CertCache::new(64));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let authority = Arc::clone(&authority);
        handles.push(tokio::spawn(async move {
            authority.get_leaf("game.mihoyo.com").await.unwrap()
        }));
    }

    let mut leaves = Vec::new();
    for handle in handles {
        leaves.push(handle.await.unwrap());
    }

    assert_eq!(authority.generated_count(), 1);
    let first = &leaves[0];
    assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, first)));
}

#[tokio::test]
async fn host_lookup_is_case_insensitive() {
    let authority = authority(CertCache::new(64));
    let lower = authority.get_leaf("game.mihoyo.com").await.unwrap();
    let upper = authority.get_leaf("GAME.MiHoYo.com").await.unwrap();

    assert!(Arc::ptr_eq(&lower, &upper));
    assert_eq!(authority.generated_count(), 1);
}

#[tokio::test]
async fn distinct_hosts_get_distinct_leaves() {
    let authority = authority(CertCache::new(64));
    let a = authority.get_leaf("a.example.com").await.unwrap();
    let b = authority.get_leaf("b.example.com").await.unwrap();

    assert_ne!(a.cert_pem, b.cert_pem);
    assert_eq!(authority.generated_count(), 2);
}

#[tokio::test]
async fn persisted_leaves_survive_a_new_authority() {
    let dir = tempfile::tempdir().unwrap();
    let ca_dir = dir.path().join("ca");
    let leaf_dir = dir.path().join("leaf");

    let (ca, _) = crepe_net::load_or_generate_ca(&ca_dir, "Test CA").unwrap();
    let first = CertificateAuthority::new(ca, CertCache::with_disk_path(8, &leaf_dir), 365);
    let leaf = first.get_leaf("sr.crepe.moe").await.unwrap();
    assert!(leaf_dir.join("sr.crepe.moe.pem").exists());

    let (ca, _) = crepe_net::load_or_generate_ca(&ca_dir, "Test CA").unwrap();
    let second = CertificateAuthority::new(ca, CertCache::with_disk_path(8, &leaf_dir), 365);
    let reloaded = second.get_leaf("sr.crepe.moe").await.unwrap();

    assert_eq!(leaf.cert_pem, reloaded.cert_pem);
    assert_eq!(second.generated_count(), 0);
}

#[tokio::test]
async fn leaves_from_a_rotated_root_are_reissued() {
    let dir = tempfile::tempdir().unwrap();
    let leaf_dir = dir.path().join("leaf");

    let old_root = generate_ca("Old CA").unwrap();
    let first = CertificateAuthority::new(old_root, CertCache::with_disk_path(8, &leaf_dir), 365);
    let stale = first.get_leaf("sdk-static.mihoyo.com").await.unwrap();

    let new_root = generate_ca("New CA").unwrap();
    let root_pem = new_root.material.cert_pem.clone();
    let second = CertificateAuthority::new(new_root, CertCache::with_disk_path(8, &leaf_dir), 365);
    let fresh = second.get_leaf("sdk-static.mihoyo.com").await.unwrap();

    assert_eq!(second.generated_count(), 1);
    assert_ne!(fresh.cert_pem, stale.cert_pem);
    assert!(pem_signed_by(&fresh.cert_pem, &root_pem).unwrap());

    // The reissued leaf replaced the stale one on disk.
    let on_disk = std::fs::read(leaf_dir.join("sdk-static.mihoyo.com.pem")).unwrap();
    assert!(pem_signed_by(&on_disk, &root_pem).unwrap());
}

#[tokio::test]
async fn failed_generation_is_isolated_and_retried() {
    let authority = authority(CertCache::new(64));

    let err = authority.get_leaf("bad host").await.unwrap_err();
    assert_eq!(err.kind, TlsErrorKind::InvalidHost);

    let good = authority.get_leaf("sr.crepe.moe").await.unwrap();
    assert_eq!(good.host, "sr.crepe.moe");

    // Nothing was cached for the failed host, so it is attempted again.
    assert_matches!(
        authority.get_leaf("bad host").await,
        Err(err) if err.kind == TlsErrorKind::InvalidHost
    );
    assert_eq!(authority.generated_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_do_not_block_the_host() {
    let authority = authority(CertCache::new(64));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let authority = Arc::clone(&authority);
        handles.push(tokio::spawn(async move { authority.get_leaf("a..b").await }));
    }
    for handle in handles {
        assert_matches!(handle.await.unwrap(), Err(err) if err.kind == TlsErrorKind::InvalidHost);
    }

    let leaf = authority.get_leaf("a.b").await.unwrap();
    assert_eq!(leaf.host, "a.b");
    assert_eq!(authority.generated_count(), 1);
}
