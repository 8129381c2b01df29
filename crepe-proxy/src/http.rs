use std::net::SocketAddr;
use std::time::Duration;

use crepe_net::{
    ClientHelloParser, ParseStatus, RequestHead, RequestHeadParser, SniParseStatus, error_response,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::rules::{Scheme, Target};

const READ_CHUNK: usize = 8192;

/// Reads whatever the client sends next. `None` means the client closed.
pub(crate) async fn read_some<S>(
    stream: &mut S,
    peer: SocketAddr,
    limit: Duration,
) -> Result<Option<Vec<u8>>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK];
    let n = timeout(limit, stream.read(&mut buffer))
        .await
        .map_err(|_| ProxyError::Protocol {
            peer,
            message: format!("client sent nothing for {limit:?}"),
        })??;
    if n == 0 {
        return Ok(None);
    }
    buffer.truncate(n);
    Ok(Some(buffer))
}

/// Reads a request head, starting from bytes already taken off the stream.
/// Returns the head and whatever followed it. A malformed head is answered
/// with a 400 before the error is returned.
pub(crate) async fn read_request_head<S>(
    stream: &mut S,
    initial: Vec<u8>,
    peer: SocketAddr,
    limit: Duration,
) -> Result<Option<(RequestHead, Vec<u8>)>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut parser = RequestHeadParser::new();
    let mut status = parser.push(&initial);

    loop {
        match status {
            ParseStatus::Complete {
                message, consumed, ..
            } => {
                let leftover = parser.into_buffer().split_off(consumed);
                return Ok(Some((message, leftover)));
            }
            ParseStatus::Error { error, .. } => {
                let _ = respond(stream, 400, "Bad Request", "malformed request").await;
                return Err(ProxyError::Protocol {
                    peer,
                    message: format!("malformed request head: {error}"),
                });
            }
            ParseStatus::NeedMore { .. } => match read_some(stream, peer, limit).await? {
                Some(bytes) => status = parser.push(&bytes),
                None if parser.buffered().is_empty() => return Ok(None),
                None => {
                    return Err(ProxyError::Protocol {
                        peer,
                        message: "connection closed inside request head".to_string(),
                    });
                }
            },
        }
    }
}

/// Reads until the ClientHello is complete and returns its server name along
/// with every byte read, so the handshake can be replayed.
pub(crate) async fn read_client_hello<S>(
    stream: &mut S,
    initial: Vec<u8>,
    peer: SocketAddr,
    limit: Duration,
) -> Result<(Option<String>, Vec<u8>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut parser = ClientHelloParser::new();
    let mut status = parser.push(&initial);

    loop {
        match status {
            SniParseStatus::Complete { server_name } => {
                return Ok((server_name, parser.into_buffer()));
            }
            SniParseStatus::Error { error } => {
                return Err(ProxyError::Protocol {
                    peer,
                    message: format!("malformed ClientHello: {error}"),
                });
            }
            SniParseStatus::NeedMore => match read_some(stream, peer, limit).await? {
                Some(bytes) => status = parser.push(&bytes),
                None => {
                    return Err(ProxyError::Protocol {
                        peer,
                        message: "connection closed inside ClientHello".to_string(),
                    });
                }
            },
        }
    }
}

pub(crate) async fn respond<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    message: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&error_response(status, reason, message))
        .await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Splits `host[:port]`, with IPv6 literals in brackets.
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> (String, u16) {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|port| port.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    if let Some((host, port)) = authority.rsplit_once(':') {
        if !host.contains(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (authority.to_string(), default_port)
}

/// Value for a `Host` header naming `target`; the port is omitted when it is
/// the scheme default.
pub(crate) fn host_header(target: &Target) -> String {
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };
    if target.port == target.scheme.default_port() {
        host
    } else {
        format!("{host}:{}", target.port)
    }
}

/// Where a request is addressed and its origin-form target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestTarget {
    pub target: Target,
    pub path: String,
    pub absolute: bool,
}

/// Resolves the destination of `head`: the absolute-form URI when present,
/// then the `Host` header, then `fallback`.
pub(crate) fn request_target(
    head: &RequestHead,
    fallback: Option<&Target>,
    peer: SocketAddr,
) -> Result<RequestTarget, ProxyError> {
    let raw = head.line.target.as_str();
    let lower = raw.to_ascii_lowercase();

    if lower.starts_with("http://") || lower.starts_with("https://") {
        let url = url::Url::parse(raw).map_err(|err| ProxyError::Protocol {
            peer,
            message: format!("invalid request target {raw:?}: {err}"),
        })?;
        let scheme = if url.scheme() == "https" {
            Scheme::Https
        } else {
            Scheme::Http
        };
        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| ProxyError::Protocol {
                peer,
                message: format!("request target {raw:?} has no host"),
            })?;
        let port = url.port().unwrap_or(scheme.default_port());
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        return Ok(RequestTarget {
            target: Target { host, port, scheme },
            path,
            absolute: true,
        });
    }

    let scheme = fallback.map(|target| target.scheme).unwrap_or(Scheme::Http);
    let target = match (head.header("host"), fallback) {
        (Some(value), fallback) => {
            let default_port = fallback
                .map(|target| target.port)
                .unwrap_or(scheme.default_port());
            let (host, port) = split_host_port(value, default_port);
            Target { host, port, scheme }
        }
        (None, Some(fallback)) => fallback.clone(),
        (None, None) => {
            return Err(ProxyError::Protocol {
                peer,
                message: "request has neither an absolute target nor a Host header".to_string(),
            });
        }
    };

    Ok(RequestTarget {
        target,
        path: raw.to_string(),
        absolute: false,
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use assert_matches::assert_matches;
    use crepe_net::{ParseStatus, RequestHead, RequestHeadParser};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::{host_header, read_request_head, request_target, split_host_port};
    use crate::ProxyError;
    use crate::rules::{Scheme, Target};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn head(raw: &[u8]) -> RequestHead {
        match RequestHeadParser::new().push(raw) {
            ParseStatus::Complete { message, .. } => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn splits_authorities() {
        assert_eq!(split_host_port("sr.crepe.moe", 443), ("sr.crepe.moe".to_string(), 443));
        assert_eq!(split_host_port("sr.crepe.moe:8443", 443), ("sr.crepe.moe".to_string(), 8443));
        assert_eq!(split_host_port("[::1]:8080", 80), ("::1".to_string(), 8080));
        assert_eq!(split_host_port("[::1]", 80), ("::1".to_string(), 80));
    }

    #[test]
    fn absolute_form_wins_over_host_header() {
        let head = head(b"GET http://api.mihoyo.com:8080/a?b=c HTTP/1.1\r\nHost: other\r\n\r\n");
        let resolved = request_target(&head, None, peer()).unwrap();
        assert!(resolved.absolute);
        assert_eq!(resolved.path, "/a?b=c");
        assert_eq!(
            resolved.target,
            Target {
                host: "api.mihoyo.com".to_string(),
                port: 8080,
                scheme: Scheme::Http,
            }
        );
    }

    #[test]
    fn origin_form_uses_host_then_fallback() {
        let fallback = Target {
            host: "sdk-static.mihoyo.com".to_string(),
            port: 443,
            scheme: Scheme::Https,
        };
        let with_host = head(b"GET /x HTTP/1.1\r\nHost: hk4e-sdk.mihoyo.com\r\n\r\n");
        let resolved = request_target(&with_host, Some(&fallback), peer()).unwrap();
        assert_eq!(resolved.target.host, "hk4e-sdk.mihoyo.com");
        assert_eq!(resolved.target.port, 443);
        assert_eq!(resolved.target.scheme, Scheme::Https);

        let without_host = head(b"GET /x HTTP/1.0\r\n\r\n");
        assert_eq!(
            request_target(&without_host, Some(&fallback), peer()).unwrap().target,
            fallback
        );
        assert_matches!(
            request_target(&without_host, None, peer()),
            Err(ProxyError::Protocol { .. })
        );
    }

    #[test]
    fn host_header_omits_default_port() {
        let mut target = Target {
            host: "sr.crepe.moe".to_string(),
            port: 443,
            scheme: Scheme::Https,
        };
        assert_eq!(host_header(&target), "sr.crepe.moe");
        target.scheme = Scheme::Http;
        assert_eq!(host_header(&target), "sr.crepe.moe:443");
    }

    #[tokio::test]
    async fn reads_head_across_chunks_and_keeps_body() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"Host: a\r\n\r\nbody").await.unwrap();
        let (head, leftover) =
            read_request_head(&mut server, b"POST /x HTTP/1.1\r\n".to_vec(), peer(), std::time::Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(head.line.method, "POST");
        assert_eq!(leftover, b"body");
    }

    #[tokio::test]
    async fn malformed_head_gets_400() {
        let (mut client, mut server) = duplex(1024);
        let result = read_request_head(
            &mut server,
            b"\x01\x02 garbage\r\n\r\n".to_vec(),
            peer(),
            std::time::Duration::from_secs(1),
        )
        .await;
        assert_matches!(result, Err(ProxyError::Protocol { .. }));

        let mut response = Vec::new();
        drop(server);
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }
}
