use std::net::IpAddr;

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    SanType,
};

use super::types::{CaCertificate, LeafCertificate, TlsError, TlsErrorKind};

pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;

pub fn generate_leaf_cert(
    host: &str,
    ca: &CaCertificate,
    validity_days: u32,
) -> Result<LeafCertificate, TlsError> {
    let ip = host.parse::<IpAddr>().ok();
    if ip.is_none() && !is_dns_name(host) {
        return Err(TlsError::new(
            TlsErrorKind::InvalidHost,
            format!("{host:?} is not a valid certificate name"),
        ));
    }

    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::NoCa;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    if let Some(ip) = ip {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(host.to_string()));
    }

    let today = Utc::now().date_naive();
    let not_before = today - Duration::days(1);
    let not_after = today
        .checked_add_signed(Duration::days(i64::from(validity_days.max(1))))
        .ok_or_else(|| {
            TlsError::new(
                TlsErrorKind::Rcgen,
                format!("validity of {validity_days} days is out of range"),
            )
        })?;
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

    let cert_pem = cert
        .serialize_pem_with_signer(&ca.cert)
        .map_err(|err| TlsError::new(TlsErrorKind::Rcgen, err.to_string()))?
        .into_bytes();
    let key_pem = cert.serialize_private_key_pem().into_bytes();

    Ok(LeafCertificate {
        host: host.to_string(),
        cert_pem,
        key_pem,
        not_after: midnight_utc(not_after),
    })
}

fn is_dns_name(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'*'))
        })
}

fn midnight_utc(date: NaiveDate) -> chrono::DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}
