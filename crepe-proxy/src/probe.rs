use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use crepe_net::{ParseStatus, ResponseHead, ResponseHeadParser};
use openssl::ssl::{SslConnector, SslMethod};
use openssl::x509::{X509, X509VerifyResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::debug;

use crate::error::ProxyError;
use crate::export::{CertFormat, PROXY_HOST};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CERT_RESPONSE: usize = 1024 * 1024;

/// Checks whether clients on this machine trust the proxy's root: tunnels to
/// `probe_host` through the proxy and verifies the intercepted handshake
/// against the system trust store.
///
/// `Ok(false)` means the handshake failed certificate verification; any other
/// failure is an error.
pub async fn ca_trusted(proxy_addr: SocketAddr, probe_host: &str) -> Result<bool, ProxyError> {
    ca_trusted_with(proxy_addr, probe_host, None).await
}

/// Like [`ca_trusted`], with `extra_root` (PEM) added to the trust store.
pub async fn ca_trusted_with(
    proxy_addr: SocketAddr,
    probe_host: &str,
    extra_root: Option<&[u8]>,
) -> Result<bool, ProxyError> {
    let handshake_failed = |message: String| ProxyError::Handshake {
        peer: probe_host.to_string(),
        message,
    };

    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|err| handshake_failed(err.to_string()))?;
    if let Some(pem) = extra_root {
        let root = X509::from_pem(pem).map_err(|err| handshake_failed(err.to_string()))?;
        builder
            .cert_store_mut()
            .add_cert(root)
            .map_err(|err| handshake_failed(err.to_string()))?;
    }
    let connector = builder.build();

    let mut stream = connect(proxy_addr).await?;
    let request = format!(
        "CONNECT {probe_host}:443 HTTP/1.1\r\nHost: {probe_host}:443\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    let (head, leftover) = read_response_head(&mut stream, proxy_addr).await?;
    if head.line.status_code != 200 {
        return Err(ProxyError::Protocol {
            peer: proxy_addr,
            message: format!("CONNECT answered with {}", head.line.status_code),
        });
    }
    if !leftover.is_empty() {
        return Err(ProxyError::Protocol {
            peer: proxy_addr,
            message: "unexpected bytes after CONNECT response".to_string(),
        });
    }

    let ssl = connector
        .configure()
        .and_then(|config| config.into_ssl(probe_host))
        .map_err(|err| handshake_failed(err.to_string()))?;
    let mut tls = SslStream::new(ssl, stream).map_err(|err| handshake_failed(err.to_string()))?;
    let result = timeout(PROBE_TIMEOUT, Pin::new(&mut tls).connect())
        .await
        .map_err(|_| handshake_failed("probe handshake timed out".to_string()))?;

    match result {
        Ok(()) => {
            let _ = tls.shutdown().await;
            Ok(true)
        }
        Err(err) => {
            let verify = tls.ssl().verify_result();
            if verify != X509VerifyResult::OK {
                debug!(host = probe_host, reason = %verify.error_string(), "proxy root not trusted");
                Ok(false)
            } else {
                Err(handshake_failed(err.to_string()))
            }
        }
    }
}

/// Downloads the root certificate from a running proxy's export endpoint.
pub async fn fetch_root_certificate(
    proxy_addr: SocketAddr,
    format: CertFormat,
) -> Result<Vec<u8>, ProxyError> {
    let path = match format {
        CertFormat::Pem => "/cert/pem",
        CertFormat::Der => "/cert/cer",
        CertFormat::Pkcs12 => "/cert/p12",
    };
    let mut stream = connect(proxy_addr).await?;
    let request = format!(
        "GET http://{PROXY_HOST}{path} HTTP/1.1\r\nHost: {PROXY_HOST}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let (head, mut body) = read_response_head(&mut stream, proxy_addr).await?;
    if head.line.status_code != 200 {
        return Err(ProxyError::Protocol {
            peer: proxy_addr,
            message: format!("certificate endpoint answered {}", head.line.status_code),
        });
    }
    let expected = head.content_length().ok_or_else(|| ProxyError::Protocol {
        peer: proxy_addr,
        message: "certificate response without Content-Length".to_string(),
    })?;
    if expected > MAX_CERT_RESPONSE {
        return Err(ProxyError::Protocol {
            peer: proxy_addr,
            message: format!("certificate response of {expected} bytes is too large"),
        });
    }
    while body.len() < expected {
        let mut chunk = vec![0u8; expected - body.len()];
        let n = timeout(PROBE_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| timed_out(proxy_addr))??;
        if n == 0 {
            return Err(ProxyError::Protocol {
                peer: proxy_addr,
                message: "certificate response truncated".to_string(),
            });
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(expected);
    Ok(body)
}

async fn connect(proxy_addr: SocketAddr) -> Result<TcpStream, ProxyError> {
    timeout(PROBE_TIMEOUT, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| timed_out(proxy_addr))?
        .map_err(|err| ProxyError::UpstreamUnreachable {
            host: proxy_addr.ip().to_string(),
            port: proxy_addr.port(),
            reason: err.to_string(),
        })
}

async fn read_response_head<S>(
    stream: &mut S,
    peer: SocketAddr,
) -> Result<(ResponseHead, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ResponseHeadParser::new();
    let mut buffer = vec![0u8; 4096];
    loop {
        let n = timeout(PROBE_TIMEOUT, stream.read(&mut buffer))
            .await
            .map_err(|_| timed_out(peer))??;
        if n == 0 {
            return Err(ProxyError::Protocol {
                peer,
                message: "proxy closed before answering".to_string(),
            });
        }
        match parser.push(&buffer[..n]) {
            ParseStatus::NeedMore { .. } => continue,
            ParseStatus::Complete {
                message, consumed, ..
            } => {
                let leftover = parser.into_buffer().split_off(consumed);
                return Ok((message, leftover));
            }
            ParseStatus::Error { error, .. } => {
                return Err(ProxyError::Protocol {
                    peer,
                    message: format!("malformed proxy response: {error}"),
                });
            }
        }
    }
}

fn timed_out(peer: SocketAddr) -> ProxyError {
    ProxyError::Protocol {
        peer,
        message: format!("no answer within {PROBE_TIMEOUT:?}"),
    }
}
