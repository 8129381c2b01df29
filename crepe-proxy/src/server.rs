use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crepe_net::{
    CaMaterial, CaMaterialPaths, CertCache, CertificateAuthority, build_connector,
    load_or_generate_ca,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{EventSink, ProxyEvents, event_channel};
use crate::listener::{ListenerContext, accept_loop};
use crate::rules::{RuleEngine, RuleSet};
use crate::upstream::UpstreamConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// How a `stop` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Connections still open when the drain timeout elapsed.
    pub forced: usize,
}

struct Running {
    local_addr: SocketAddr,
    accept_cancel: CancellationToken,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
}

/// Owns the listener and every connection handler spawned from it.
///
/// `start` and `stop` are idempotent, and a stopped server can be started
/// again on a fresh listener. Configuration is fixed while the server is not
/// stopped.
pub struct ProxyServer {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    ca_paths: CaMaterialPaths,
    events: EventSink,
    state: ServerState,
    running: Option<Running>,
}

impl ProxyServer {
    /// Loads (or creates) the root CA. A CA that cannot be loaded is fatal.
    pub fn new(config: ProxyConfig) -> Result<(Self, ProxyEvents), ProxyError> {
        config.validate()?;
        let (authority, ca_paths) = load_authority(&config)?;
        let (events, stream) = event_channel();
        Ok((
            Self {
                config,
                authority,
                ca_paths,
                events,
                state: ServerState::Stopped,
                running: None,
            },
            stream,
        ))
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn root_certificate(&self) -> &CaMaterial {
        self.authority.root()
    }

    pub fn ca_paths(&self) -> &CaMaterialPaths {
        &self.ca_paths
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    pub fn set_config(&mut self, config: ProxyConfig) -> Result<(), ProxyError> {
        self.ensure_stopped()?;
        config.validate()?;
        if config.tls != self.config.tls {
            let (authority, ca_paths) = load_authority(&config)?;
            self.authority = authority;
            self.ca_paths = ca_paths;
        }
        self.config = config;
        Ok(())
    }

    pub fn set_rules(&mut self, rules: RuleSet) -> Result<(), ProxyError> {
        self.ensure_stopped()?;
        let mut config = self.config.clone();
        config.rules = rules;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub async fn start(&mut self) -> Result<SocketAddr, ProxyError> {
        if self.state == ServerState::Running {
            if let Some(addr) = self.local_addr() {
                return Ok(addr);
            }
        }
        // A stop that was interrupted part way finishes first.
        if self.running.is_some() {
            self.stop().await?;
        }

        self.state = ServerState::Starting;
        match self.spawn().await {
            Ok(running) => {
                let addr = running.local_addr;
                self.running = Some(running);
                self.state = ServerState::Running;
                info!(addr = %addr, rules = self.config.rules.rules.len(), "proxy started");
                Ok(addr)
            }
            Err(err) => {
                self.state = ServerState::Stopped;
                Err(err)
            }
        }
    }

    async fn spawn(&self) -> Result<Running, ProxyError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;

        let tls = self.config.tls_config();
        let connector = build_connector(&tls).map_err(|err| ProxyError::Config(err.message))?;
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(ListenerContext {
            config: self.config.clone(),
            local_addr,
            rules: RuleEngine::new(&self.config.rules),
            authority: Arc::clone(&self.authority),
            upstream: UpstreamConnector::new(
                connector,
                self.config.upstream.insecure,
                self.config.upstream.connect_timeout,
                self.config.upstream.handshake_timeout,
            ),
            tls,
            events: self.events.clone(),
            shutdown: shutdown.clone(),
        });

        let accept_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            accept_cancel.clone(),
            tracker.clone(),
        ));

        Ok(Running {
            local_addr,
            accept_cancel,
            shutdown,
            tracker,
            accept_task: Some(accept_task),
        })
    }

    /// Stops accepting, lets in-flight connections drain for the configured
    /// timeout, then closes whatever is left. Returns once every handler has
    /// exited.
    pub async fn stop(&mut self) -> Result<StopReport, ProxyError> {
        let Some(running) = self.running.as_mut() else {
            self.state = ServerState::Stopped;
            return Ok(StopReport { forced: 0 });
        };
        self.state = ServerState::Stopping;

        running.accept_cancel.cancel();
        if let Some(accept_task) = running.accept_task.take() {
            if let Err(err) = accept_task.await {
                warn!(error = %err, "accept loop ended abnormally");
            }
        }
        running.tracker.close();

        let drain = self.config.shutdown.drain_timeout;
        let mut forced = 0;
        if tokio::time::timeout(drain, running.tracker.wait()).await.is_err() {
            forced = running.tracker.len();
            warn!(remaining = forced, "drain timeout elapsed, closing connections");
            running.shutdown.cancel();
            running.tracker.wait().await;
        }

        self.running = None;
        self.state = ServerState::Stopped;
        info!(forced, "proxy stopped");
        Ok(StopReport { forced })
    }

    fn ensure_stopped(&self) -> Result<(), ProxyError> {
        if self.state == ServerState::Stopped {
            Ok(())
        } else {
            Err(ProxyError::ConfigLocked)
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.accept_cancel.cancel();
            running.shutdown.cancel();
        }
    }
}

fn load_authority(
    config: &ProxyConfig,
) -> Result<(Arc<CertificateAuthority>, CaMaterialPaths), ProxyError> {
    let (ca, paths) = load_or_generate_ca(&config.tls.ca_cert_dir, &config.tls.ca_common_name)
        .map_err(|err| ProxyError::RootCa(err.to_string()))?;
    let cache = CertCache::with_disk_path(config.tls.leaf_cache_capacity, &config.tls.leaf_cert_dir);
    let authority = CertificateAuthority::new(ca, cache, config.tls.leaf_validity_days);
    Ok((Arc::new(authority), paths))
}
