use std::fs;
use std::path::Path;

use chrono::{Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

use super::openssl::{pem_not_after, pem_to_der};
use super::types::{CaCertificate, CaMaterial, CaMaterialPaths, TlsError, TlsErrorKind};

const DEFAULT_CA_VALIDITY_DAYS: i64 = 3650;
const CA_CERT_FILE: &str = "crepe-ca.pem";
const CA_KEY_FILE: &str = "crepe-ca-key.pem";

pub fn generate_ca(common_name: &str) -> Result<CaCertificate, TlsError> {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "Crepe Proxy");
    params.distinguished_name = dn;

    let not_before = Utc::now() - Duration::days(1);
    let not_after = Utc::now() + Duration::days(DEFAULT_CA_VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(
        not_before.year(),
        not_before.month() as u8,
        not_before.day() as u8,
    );
    params.not_after = rcgen::date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );

    let cert = Certificate::from_params(params)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;

    // One serialization only: every self-signed serialization carries a fresh signature.
    let cert_pem = cert
        .serialize_pem()
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?
        .into_bytes();
    let cert_der = pem_to_der(&cert_pem)?;
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(CaCertificate {
        material: CaMaterial {
            cert_pem,
            key_pem,
            cert_der,
        },
        cert,
    })
}

/// Loads the root CA persisted in `dir`, generating and writing a new one when
/// none exists or the stored one has expired.
pub fn load_or_generate_ca(
    dir: impl AsRef<Path>,
    common_name: &str,
) -> Result<(CaCertificate, CaMaterialPaths), TlsError> {
    let dir = dir.as_ref();
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
        match load_ca(&cert_path, &key_path) {
            Ok(ca) => return Ok((ca, CaMaterialPaths { cert_path, key_path })),
            Err(err) if err.kind == TlsErrorKind::Expired => {}
            Err(err) => return Err(err),
        }
    }

    let ca = generate_ca(common_name)?;
    let paths = write_ca_to_dir(dir, &ca.material)?;
    Ok((ca, paths))
}

fn load_ca(cert_path: &Path, key_path: &Path) -> Result<CaCertificate, TlsError> {
    let cert_pem =
        fs::read(cert_path).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    let key_pem =
        fs::read(key_path).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    if pem_not_after(&cert_pem)? <= Utc::now() {
        return Err(TlsError::new(
            TlsErrorKind::Expired,
            format!("root certificate {} has expired", cert_path.display()),
        ));
    }

    let cert_text = String::from_utf8_lossy(&cert_pem);
    let key_text = String::from_utf8_lossy(&key_pem);
    let key_pair = KeyPair::from_pem(&key_text)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
    let params = CertificateParams::from_ca_cert_pem(&cert_text, key_pair)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
    let cert = Certificate::from_params(params)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?;
    let cert_der = pem_to_der(&cert_pem)?;

    Ok(CaCertificate {
        material: CaMaterial {
            cert_pem,
            key_pem,
            cert_der,
        },
        cert,
    })
}

pub fn write_ca_to_dir(
    dir: impl AsRef<Path>,
    material: &CaMaterial,
) -> Result<CaMaterialPaths, TlsError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    fs::write(&cert_path, &material.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;
    fs::write(&key_path, &material.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::Io, err.to_string()))?;

    Ok(CaMaterialPaths {
        cert_path,
        key_path,
    })
}

#[cfg(test)]
mod tests {
    use super::{generate_ca, load_or_generate_ca};

    #[test]
    fn generated_ca_is_pem_and_der() {
        let ca = generate_ca("Test CA").unwrap();
        assert!(ca.material.cert_pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert!(!ca.material.cert_der.is_empty());
        assert!(String::from_utf8_lossy(&ca.material.key_pem).contains("PRIVATE KEY"));
    }

    #[test]
    fn persisted_ca_is_reused_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (first, paths) = load_or_generate_ca(dir.path(), "Test CA").unwrap();
        assert!(paths.cert_path.exists());
        assert!(paths.key_path.exists());

        let (second, _) = load_or_generate_ca(dir.path(), "Test CA").unwrap();
        assert_eq!(first.material.cert_pem, second.material.cert_pem);
        assert_eq!(first.material.key_pem, second.material.key_pem);
    }
}
