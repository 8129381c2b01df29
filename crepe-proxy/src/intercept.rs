use std::net::SocketAddr;
use std::pin::Pin;

use crepe_net::{RequestHead, build_acceptor};
use openssl::ssl::Ssl;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::events::ProxyEventKind;
use crate::export::export_response;
use crate::http::{RequestTarget, host_header, read_request_head, request_target, respond};
use crate::listener::ListenerContext;
use crate::relay::{RelayStats, relay_bounded};
use crate::rules::{Decision, Scheme, Target};
use crate::session::{Session, SessionState};

/// Terminates the client's TLS with a leaf for `server_name`, then forwards
/// the decrypted request.
///
/// `server_name` only selects the certificate. Routing is decided again from
/// the decrypted `Host` header, which wins over SNI when the two differ.
pub(crate) async fn intercept_tls<S>(
    ctx: &ListenerContext,
    session: &mut Session,
    client: S,
    server_name: &str,
    port: u16,
) -> Result<Option<RelayStats>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    session.advance(SessionState::Handshaking)?;
    session.negotiate(server_name, port);

    let cert_failed = |message: String| ProxyError::CertificateGeneration {
        host: server_name.to_string(),
        message,
    };
    let leaf = ctx
        .authority
        .get_leaf(server_name)
        .await
        .map_err(|err| cert_failed(err.message))?;
    let acceptor = build_acceptor(&ctx.tls, &leaf).map_err(|err| cert_failed(err.message))?;

    let handshake_failed = |message: String| ProxyError::Handshake {
        peer: session.client_addr.to_string(),
        message,
    };
    let ssl = Ssl::new(acceptor.context()).map_err(|err| handshake_failed(err.to_string()))?;
    let mut tls = SslStream::new(ssl, client).map_err(|err| handshake_failed(err.to_string()))?;
    timeout(ctx.config.listen.client_timeout, Pin::new(&mut tls).accept())
        .await
        .map_err(|_| handshake_failed("client handshake timed out".to_string()))?
        .map_err(|err| handshake_failed(err.to_string()))?;
    session.advance(SessionState::Decrypted)?;
    debug!(session = %session.id, host = server_name, "client handshake complete");

    let Some((head, leftover)) = read_request_head(
        &mut tls,
        Vec::new(),
        session.client_addr,
        ctx.config.listen.client_timeout,
    )
    .await?
    else {
        return Ok(None);
    };

    let fallback = Target {
        host: server_name.to_string(),
        port,
        scheme: Scheme::Https,
    };
    forward_request(ctx, session, tls, head, leftover, Some(&fallback)).await
}

/// Applies the rules to a parsed request and relays it to where they point.
///
/// Exactly one request travels over the upstream connection. It is sent with
/// `Connection: close`, and client bytes past its body are never forwarded, so
/// a keep-alive client has to reconnect and its next request is routed afresh.
/// Upgrade requests are the exception and stay relayed both ways.
pub(crate) async fn forward_request<S>(
    ctx: &ListenerContext,
    session: &mut Session,
    mut client: S,
    mut head: RequestHead,
    leftover: Vec<u8>,
    fallback: Option<&Target>,
) -> Result<Option<RelayStats>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let RequestTarget {
        target: original,
        path,
        absolute,
    } = match request_target(&head, fallback, session.client_addr) {
        Ok(resolved) => resolved,
        Err(err) => {
            let _ = respond(&mut client, 400, "Bad Request", "missing request host").await;
            return Err(err);
        }
    };
    session.negotiate(&original.host, original.port);

    let body = match request_body(&head, session.client_addr) {
        Ok(body) => body,
        Err(err) => {
            let _ = respond(&mut client, 400, "Bad Request", &err.to_string()).await;
            return Err(err);
        }
    };

    if ctx.is_self_request(&original, &path, absolute) {
        debug!(session = %session.id, path = %path, "serving root certificate");
        client
            .write_all(&export_response(&path, ctx.authority.root()))
            .await?;
        client.shutdown().await?;
        return Ok(None);
    }

    let resolved = match ctx.rules.evaluate(&original.host) {
        Decision::Block => {
            info!(session = %session.id, host = %original.host, "logging server blocked");
            ctx.events.publish(
                session.id,
                ProxyEventKind::Blocked {
                    host: original.host.clone(),
                },
            );
            let _ = respond(&mut client, 404, "Not Found", "blocked by proxy").await;
            return Ok(None);
        }
        Decision::Redirect(redirect) => {
            let resolved = redirect.resolve(&original);
            info!(session = %session.id, host = %original.host, target = %resolved, "redirected");
            ctx.events.publish(
                session.id,
                ProxyEventKind::Redirected {
                    host: original.host.clone(),
                    target: resolved.to_string(),
                },
            );
            head.set_header("Host", host_header(&resolved));
            resolved
        }
        Decision::Pass => {
            debug!(session = %session.id, target = %original, "passing through");
            ctx.events.publish(
                session.id,
                ProxyEventKind::Passed {
                    host: original.host.clone(),
                },
            );
            original
        }
    };

    head.line.target = path;
    head.remove_header("proxy-connection");
    if body != RequestBody::Upgrade {
        head.set_header("Connection", "close");
    }

    let mut upstream = match ctx.upstream.connect(&resolved).await {
        Ok(upstream) => upstream,
        Err(err) => {
            if let Some((status, reason)) = err.status() {
                let _ = respond(&mut client, status, reason, &err.to_string()).await;
            }
            return Err(err);
        }
    };

    let mut request = head.to_bytes();
    let limit = match body {
        RequestBody::Length(length) => {
            // Anything read past the body is a pipelined request; drop it.
            let sent = leftover
                .len()
                .min(usize::try_from(length).unwrap_or(usize::MAX));
            request.extend_from_slice(&leftover[..sent]);
            Some(length - sent as u64)
        }
        RequestBody::Chunked | RequestBody::Upgrade => {
            request.extend_from_slice(&leftover);
            None
        }
    };
    upstream.write_all(&request).await?;
    upstream.flush().await?;

    session.advance(SessionState::Relaying)?;
    Ok(Some(
        relay_bounded(client, upstream, limit, &ctx.shutdown).await,
    ))
}

/// Client bytes after the head that belong to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestBody {
    Length(u64),
    /// Relayed until either side closes; `Connection: close` ends it.
    Chunked,
    /// Protocol switch; the connection is relayed both ways as-is.
    Upgrade,
}

fn request_body(head: &RequestHead, peer: SocketAddr) -> Result<RequestBody, ProxyError> {
    if head.header("upgrade").is_some() {
        return Ok(RequestBody::Upgrade);
    }
    if head.header("transfer-encoding").is_some() {
        return Ok(RequestBody::Chunked);
    }
    match head.header("content-length") {
        None => Ok(RequestBody::Length(0)),
        Some(value) => value
            .trim()
            .parse()
            .map(RequestBody::Length)
            .map_err(|_| ProxyError::Protocol {
                peer,
                message: format!("invalid content-length {value:?}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use assert_matches::assert_matches;
    use crepe_net::{ParseStatus, RequestHead, RequestHeadParser};

    use super::{RequestBody, request_body};
    use crate::ProxyError;

    fn head(raw: &[u8]) -> RequestHead {
        match RequestHeadParser::new().push(raw) {
            ParseStatus::Complete { message, .. } => message,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frames_request_bodies() {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let get = head(b"GET / HTTP/1.1\r\nHost: a.example\r\n\r\n");
        assert_eq!(request_body(&get, peer).unwrap(), RequestBody::Length(0));

        let post = head(b"POST /log HTTP/1.1\r\nHost: a.example\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(request_body(&post, peer).unwrap(), RequestBody::Length(12));

        let chunked =
            head(b"POST / HTTP/1.1\r\nHost: a.example\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(request_body(&chunked, peer).unwrap(), RequestBody::Chunked);

        let upgrade =
            head(b"GET /ws HTTP/1.1\r\nHost: a.example\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n");
        assert_eq!(request_body(&upgrade, peer).unwrap(), RequestBody::Upgrade);

        let bogus = head(b"POST / HTTP/1.1\r\nHost: a.example\r\nContent-Length: -1\r\n\r\n");
        assert_matches!(request_body(&bogus, peer), Err(ProxyError::Protocol { .. }));
    }
}
