mod http1;
mod sni;
mod stream;
mod tls;

pub use http1::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseStatus, ParseWarning,
    ParseWarningKind, RequestHead, RequestHeadParser, RequestLine, ResponseHead,
    ResponseHeadParser, StatusLine, error_response, synthetic_response,
};

pub use sni::{
    ClientHelloParser, SniError, SniErrorKind, SniParseStatus, is_tls_handshake,
    parse_client_hello,
};

pub use stream::PrefixedStream;

pub use tls::{
    CaCertificate, CaMaterial, CaMaterialPaths, CertCache, CertificateAuthority,
    DEFAULT_LEAF_VALIDITY_DAYS, LeafCertificate, TlsConfig, TlsError, TlsErrorKind,
    build_acceptor, build_connector, connect_ssl, export_pkcs12, generate_ca, generate_leaf_cert,
    load_or_generate_ca, pem_not_after, pem_signed_by, pem_to_der, write_ca_to_dir,
};
