mod authority;
mod ca;
mod cache;
mod cert;
mod openssl;
mod types;

pub use authority::CertificateAuthority;
pub use ca::{generate_ca, load_or_generate_ca, write_ca_to_dir};
pub use cache::CertCache;
pub use cert::{DEFAULT_LEAF_VALIDITY_DAYS, generate_leaf_cert};
pub use openssl::{
    TlsConfig, build_acceptor, build_connector, connect_ssl, export_pkcs12, pem_not_after,
    pem_signed_by, pem_to_der,
};
pub use types::{
    CaCertificate, CaMaterial, CaMaterialPaths, LeafCertificate, TlsError, TlsErrorKind,
};
