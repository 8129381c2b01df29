use crepe_net::{CaMaterial, error_response, export_pkcs12, synthetic_response};
use tracing::warn;

/// Host name the proxy answers for itself, whatever the listen address.
pub const PROXY_HOST: &str = "crepe.proxy";

const PKCS12_FRIENDLY_NAME: &str = "Crepe Proxy CA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertFormat {
    Pem,
    Der,
    Pkcs12,
}

impl CertFormat {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        match path.trim_end_matches('/') {
            "/cert" | "/cert/pem" => Some(CertFormat::Pem),
            "/cert/cer" => Some(CertFormat::Der),
            "/cert/p12" => Some(CertFormat::Pkcs12),
            _ => None,
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            CertFormat::Pem => "crepe-ca.pem",
            CertFormat::Der => "crepe-ca.cer",
            CertFormat::Pkcs12 => "crepe-ca.p12",
        }
    }
}

/// Builds the full HTTP response for a request to the export endpoint.
pub fn export_response(path: &str, root: &CaMaterial) -> Vec<u8> {
    let Some(format) = CertFormat::from_path(path) else {
        return error_response(404, "Not Found", "unknown certificate path");
    };

    let (content_type, body) = match format {
        CertFormat::Pem => ("application/x-x509-ca-cert", root.cert_pem.clone()),
        CertFormat::Der => ("application/pkix-cert", root.cert_der.clone()),
        CertFormat::Pkcs12 => match export_pkcs12(root, PKCS12_FRIENDLY_NAME) {
            Ok(bytes) => ("application/x-pkcs12", bytes),
            Err(err) => {
                warn!(error = %err, "failed to encode root certificate as PKCS#12");
                return error_response(500, "Internal Server Error", "PKCS#12 export failed");
            }
        },
    };

    let mut response = synthetic_response(200, "OK", content_type, &body);
    let disposition = format!(
        "Content-Disposition: attachment; filename=\"{}\"\r\n",
        format.file_name()
    );
    // Insert after the status line; the synthetic head is plain ASCII.
    if let Some(position) = response.windows(2).position(|window| window == b"\r\n") {
        response.splice(position + 2..position + 2, disposition.into_bytes());
    }
    response
}

#[cfg(test)]
mod tests {
    use crepe_net::{ParseStatus, ResponseHeadParser, generate_ca};

    use super::{CertFormat, export_response};

    #[test]
    fn recognizes_paths() {
        assert_eq!(CertFormat::from_path("/cert"), Some(CertFormat::Pem));
        assert_eq!(CertFormat::from_path("/cert/pem?x=1"), Some(CertFormat::Pem));
        assert_eq!(CertFormat::from_path("/cert/cer"), Some(CertFormat::Der));
        assert_eq!(CertFormat::from_path("/cert/p12/"), Some(CertFormat::Pkcs12));
        assert_eq!(CertFormat::from_path("/certificate"), None);
        assert_eq!(CertFormat::from_path("/"), None);
    }

    #[test]
    fn serves_pem_and_der() {
        let ca = generate_ca("Export Test CA").unwrap();

        let pem = export_response("/cert/pem", &ca.material);
        let mut parser = ResponseHeadParser::new();
        let ParseStatus::Complete {
            message, consumed, ..
        } = parser.push(&pem)
        else {
            panic!("incomplete response");
        };
        assert_eq!(message.line.status_code, 200);
        assert_eq!(message.header("content-type"), Some("application/x-x509-ca-cert"));
        assert!(message.header("content-disposition").is_some());
        assert_eq!(&pem[consumed..], ca.material.cert_pem.as_slice());

        let der = export_response("/cert/cer", &ca.material);
        assert!(der.ends_with(&ca.material.cert_der));
    }

    #[test]
    fn pkcs12_parses_back() {
        let ca = generate_ca("Export Test CA").unwrap();
        let response = export_response("/cert/p12", &ca.material);
        let mut parser = ResponseHeadParser::new();
        let ParseStatus::Complete { consumed, .. } = parser.push(&response) else {
            panic!("incomplete response");
        };
        let parsed = openssl::pkcs12::Pkcs12::from_der(&response[consumed..])
            .unwrap()
            .parse2("")
            .unwrap();
        let cert = parsed.cert.or_else(|| parsed.ca.and_then(|mut stack| stack.pop()));
        assert_eq!(cert.unwrap().to_der().unwrap(), ca.material.cert_der);
    }

    #[test]
    fn unknown_path_is_not_found() {
        let ca = generate_ca("Export Test CA").unwrap();
        let response = export_response("/cert/zip", &ca.material);
        assert!(response.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    }
}
