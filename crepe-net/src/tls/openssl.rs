use chrono::{DateTime, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::ssl::{
    AlpnError, Ssl, SslAcceptor, SslAcceptorBuilder, SslConnector, SslMethod, SslOptions,
    SslVerifyMode, select_next_proto,
};
use openssl::x509::X509;

use super::types::{CaMaterial, LeafCertificate, TlsError, TlsErrorKind};

const ALPN_HTTP11: &[u8] = b"\x08http/1.1";

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub allow_legacy: bool,
    /// Skip certificate and hostname verification toward upstream servers.
    pub upstream_insecure: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            allow_legacy: false,
            upstream_insecure: true,
        }
    }
}

pub fn build_acceptor(config: &TlsConfig, leaf: &LeafCertificate) -> Result<SslAcceptor, TlsError> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    apply_legacy(&mut builder, config.allow_legacy)?;

    let cert = X509::from_pem(&leaf.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    let key = PKey::private_key_from_pem(&leaf.key_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder
        .set_certificate(&cert)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    builder
        .set_private_key(&key)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;

    builder.set_verify(SslVerifyMode::NONE);
    // Only HTTP/1.x is parsed after decryption.
    builder.set_alpn_select_callback(|_, client| {
        select_next_proto(ALPN_HTTP11, client).ok_or(AlpnError::NOACK)
    });

    Ok(builder.build())
}

pub fn build_connector(config: &TlsConfig) -> Result<SslConnector, TlsError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    if config.upstream_insecure {
        builder.set_verify(SslVerifyMode::NONE);
    }
    builder
        .set_alpn_protos(ALPN_HTTP11)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    Ok(builder.build())
}

/// Prepares a client session toward `host`, with SNI set.
pub fn connect_ssl(connector: &SslConnector, host: &str, insecure: bool) -> Result<Ssl, TlsError> {
    let mut config = connector
        .configure()
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    if insecure {
        config.set_verify_hostname(false);
        config.set_verify(SslVerifyMode::NONE);
    }
    config
        .into_ssl(host)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))
}

fn apply_legacy(builder: &mut SslAcceptorBuilder, allow_legacy: bool) -> Result<(), TlsError> {
    if allow_legacy {
        builder.set_options(SslOptions::NO_TICKET);
        builder.clear_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
        builder
            .set_cipher_list("ALL:@SECLEVEL=0")
            .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    } else {
        builder.set_options(SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3);
    }
    Ok(())
}

pub fn pem_to_der(pem: &[u8]) -> Result<Vec<u8>, TlsError> {
    X509::from_pem(pem)
        .and_then(|cert| cert.to_der())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))
}

pub fn pem_not_after(pem: &[u8]) -> Result<DateTime<Utc>, TlsError> {
    let cert = X509::from_pem(pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    let now = Asn1Time::days_from_now(0)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    let diff = now
        .diff(cert.not_after())
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    Ok(Utc::now() + Duration::days(i64::from(diff.days)) + Duration::seconds(i64::from(diff.secs)))
}

/// Whether the certificate in `leaf_pem` was signed by the key of the
/// certificate in `issuer_pem`.
pub fn pem_signed_by(leaf_pem: &[u8], issuer_pem: &[u8]) -> Result<bool, TlsError> {
    let openssl_err =
        |err: openssl::error::ErrorStack| TlsError::new(TlsErrorKind::OpenSsl, err.to_string());
    let leaf = X509::from_pem(leaf_pem).map_err(openssl_err)?;
    let issuer = X509::from_pem(issuer_pem).map_err(openssl_err)?;
    let key = issuer.public_key().map_err(openssl_err)?;
    leaf.verify(&key).map_err(openssl_err)
}

/// Certificate-only PKCS#12 bundle of the root, as consumed by Windows `certutil`.
pub fn export_pkcs12(material: &CaMaterial, friendly_name: &str) -> Result<Vec<u8>, TlsError> {
    let cert = X509::from_pem(&material.cert_pem)
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    let bundle = Pkcs12::builder()
        .name(friendly_name)
        .cert(&cert)
        .build2("")
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))?;
    bundle
        .to_der()
        .map_err(|err| TlsError::new(TlsErrorKind::OpenSsl, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{TlsConfig, build_acceptor, build_connector, export_pkcs12, pem_signed_by};
    use crate::tls::ca::generate_ca;
    use crate::tls::cert::generate_leaf_cert;

    #[test]
    fn acceptor_loads_leaf() {
        let ca = generate_ca("Test CA").unwrap();
        let leaf = generate_leaf_cert("example.com", &ca, 30).unwrap();
        assert!(build_acceptor(&TlsConfig::default(), &leaf).is_ok());
        assert!(build_connector(&TlsConfig::default()).is_ok());
    }

    #[test]
    fn signature_check_tells_roots_apart() {
        let ca = generate_ca("Test CA").unwrap();
        let other = generate_ca("Other CA").unwrap();
        let leaf = generate_leaf_cert("example.com", &ca, 30).unwrap();
        assert!(pem_signed_by(&leaf.cert_pem, &ca.material.cert_pem).unwrap());
        assert!(!pem_signed_by(&leaf.cert_pem, &other.material.cert_pem).unwrap());
    }

    #[test]
    fn pkcs12_bundle_parses_back() {
        let ca = generate_ca("Test CA").unwrap();
        let der = export_pkcs12(&ca.material, "Test CA").unwrap();
        let parsed = openssl::pkcs12::Pkcs12::from_der(&der).unwrap();
        let bundle = parsed.parse2("").unwrap();
        let cert = bundle.cert.or_else(|| bundle.ca.and_then(|stack| stack.into_iter().next()));
        assert!(cert.is_some());
    }
}
