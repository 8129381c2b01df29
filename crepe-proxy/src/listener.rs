use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crepe_net::{CertificateAuthority, PrefixedStream, TlsConfig, is_tls_handshake};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{EventSink, ProxyEventKind};
use crate::export::PROXY_HOST;
use crate::http::{read_client_hello, read_request_head, read_some, respond, split_host_port};
use crate::intercept::{forward_request, intercept_tls};
use crate::relay::{RelayStats, relay};
use crate::rules::{Decision, RuleEngine, Scheme, Target};
use crate::session::{Session, SessionState};
use crate::upstream::UpstreamConnector;

const TLS_PORT: u16 = 443;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
/// Time a cancelled relay gets to close its streams before its handler is dropped.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Everything a connection handler reads. Built once per `start` and shared
/// read-only by all handlers of that run.
pub(crate) struct ListenerContext {
    pub config: ProxyConfig,
    pub local_addr: SocketAddr,
    pub rules: RuleEngine,
    pub authority: Arc<CertificateAuthority>,
    pub tls: TlsConfig,
    pub upstream: UpstreamConnector,
    pub events: EventSink,
    /// Fired when draining gives up; in-flight relays close on it.
    pub shutdown: CancellationToken,
}

impl ListenerContext {
    /// True for requests addressed to the proxy rather than through it.
    pub fn is_self_request(&self, target: &Target, path: &str, absolute: bool) -> bool {
        if target.host.eq_ignore_ascii_case(PROXY_HOST) {
            return true;
        }
        if absolute || !path.starts_with("/cert") {
            return false;
        }
        let listen_host = self.config.listen.host.as_str();
        let local_ip = self.local_addr.ip().to_string();
        target.port == self.local_addr.port()
            && (target.host == local_ip || target.host.eq_ignore_ascii_case(listen_host))
    }
}

pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        let ctx = Arc::clone(&ctx);
        tracker.spawn(handle_connection(ctx, stream, peer));
    }
    debug!(addr = %ctx.local_addr, "accept loop stopped");
}

async fn handle_connection(ctx: Arc<ListenerContext>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let mut session = Session::new(peer);
    ctx.events
        .publish(session.id, ProxyEventKind::Accepted { client_addr: peer });

    let outcome = tokio::select! {
        result = serve(&ctx, &mut session, stream) => Some(result),
        _ = force_closed(&ctx.shutdown) => None,
    };

    let stats = match outcome {
        Some(Ok(stats)) => {
            session.close();
            stats
        }
        Some(Err(err)) => {
            session.fail();
            report(&ctx, &session, &err);
            None
        }
        None => {
            debug!(session = %session.id, "connection force-closed");
            session.fail();
            None
        }
    };

    let (bytes_up, bytes_down) = stats
        .map(|stats| (stats.bytes_up, stats.bytes_down))
        .unwrap_or_default();
    debug!(
        session = %session.id,
        host = session.negotiated_host.as_deref().unwrap_or("-"),
        bytes_up,
        bytes_down,
        state = %session.state(),
        "connection closed"
    );
    ctx.events.publish(
        session.id,
        ProxyEventKind::Closed {
            bytes_up,
            bytes_down,
            duration_ms: session.elapsed_ms(),
        },
    );
}

async fn force_closed(shutdown: &CancellationToken) {
    shutdown.cancelled().await;
    tokio::time::sleep(FORCE_CLOSE_GRACE).await;
}

fn report(ctx: &ListenerContext, session: &Session, err: &ProxyError) {
    match err {
        ProxyError::UpstreamUnreachable { .. } | ProxyError::CertificateGeneration { .. } => {
            warn!(session = %session.id, client = %session.client_addr, error = %err, "connection failed");
        }
        _ => {
            debug!(session = %session.id, client = %session.client_addr, error = %err, "connection failed");
        }
    }
    ctx.events.publish(
        session.id,
        ProxyEventKind::Failed {
            message: err.to_string(),
            status: err.status().map(|(status, _)| status),
        },
    );
}

/// Classifies the connection from its first bytes: a TLS ClientHello (the
/// client was redirected here transparently), a CONNECT request, or a plain
/// HTTP proxy request.
async fn serve(
    ctx: &ListenerContext,
    session: &mut Session,
    mut stream: TcpStream,
) -> Result<Option<RelayStats>, ProxyError> {
    let peer = session.client_addr;
    let limit = ctx.config.listen.client_timeout;
    let Some(first) = read_some(&mut stream, peer, limit).await? else {
        return Ok(None);
    };

    if is_tls_handshake(&first) {
        let (server_name, buffered) = read_client_hello(&mut stream, first, peer, limit).await?;
        let Some(server_name) = server_name else {
            return Err(ProxyError::Protocol {
                peer,
                message: "transparent TLS connection without SNI".to_string(),
            });
        };
        let client = PrefixedStream::new(buffered, stream);
        return intercept_tls(ctx, session, client, &server_name, TLS_PORT).await;
    }

    let Some((head, leftover)) = read_request_head(&mut stream, first, peer, limit).await? else {
        return Ok(None);
    };
    if head.is_connect() {
        return tunnel(ctx, session, stream, &head.line.target, leftover).await;
    }
    forward_request(ctx, session, stream, head, leftover, None).await
}

async fn tunnel(
    ctx: &ListenerContext,
    session: &mut Session,
    mut stream: TcpStream,
    authority: &str,
    leftover: Vec<u8>,
) -> Result<Option<RelayStats>, ProxyError> {
    let peer = session.client_addr;
    let limit = ctx.config.listen.client_timeout;
    let (host, port) = split_host_port(authority, TLS_PORT);
    session.negotiate(&host, port);

    let decision = ctx.rules.evaluate(&host);
    if decision == Decision::Block {
        info!(session = %session.id, host = %host, "logging server blocked");
        ctx.events
            .publish(session.id, ProxyEventKind::Blocked { host: host.clone() });
        let _ = respond(&mut stream, 404, "Not Found", "blocked by proxy").await;
        return Ok(None);
    }

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    if decision == Decision::Pass && !ctx.config.tls.intercept_passthrough {
        debug!(session = %session.id, host = %host, port, "tunneling without interception");
        ctx.events
            .publish(session.id, ProxyEventKind::Passed { host: host.clone() });
        let upstream = ctx.upstream.connect_tcp(&host, port).await?;
        session.advance(SessionState::Relaying)?;
        let client = PrefixedStream::new(leftover, stream);
        return Ok(Some(relay(client, upstream, &ctx.shutdown).await));
    }

    let first = if leftover.is_empty() {
        match read_some(&mut stream, peer, limit).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        }
    } else {
        leftover
    };

    if is_tls_handshake(&first) {
        let (server_name, buffered) = read_client_hello(&mut stream, first, peer, limit).await?;
        let server_name = server_name.unwrap_or(host);
        let client = PrefixedStream::new(buffered, stream);
        return intercept_tls(ctx, session, client, &server_name, port).await;
    }

    let Some((head, leftover)) = read_request_head(&mut stream, first, peer, limit).await? else {
        return Ok(None);
    };
    let fallback = Target {
        host,
        port,
        scheme: Scheme::Http,
    };
    forward_request(ctx, session, stream, head, leftover, Some(&fallback)).await
}
