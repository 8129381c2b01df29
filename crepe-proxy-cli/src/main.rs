use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use crepe_proxy::{GameProfile, ProxyConfig, ProxyEvents, ProxyServer, RuleSet, ServerTarget, probe};
use tracing::{debug, error, info, warn};

mod system;

use system::{Platform, SystemIntegration};

/// Host tunneled through the proxy to check whether its root is trusted.
const PROBE_HOST: &str = "google.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Profile {
    /// Honkai: Star Rail
    #[value(name = "sr", alias = "star-rail")]
    StarRail,
    /// Genshin Impact
    #[value(name = "ys", alias = "genshin")]
    Genshin,
}

impl From<Profile> for GameProfile {
    fn from(profile: Profile) -> Self {
        match profile {
            Profile::StarRail => GameProfile::StarRail,
            Profile::Genshin => GameProfile::Genshin,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "crepe-proxy", version, about = "Redirects game traffic to a private server")]
struct Cli {
    /// Listen host.
    #[arg(long)]
    ip: Option<String>,
    /// Listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Listen address as host[:port].
    #[arg(long, value_name = "HOST[:PORT]")]
    address: Option<String>,
    /// Leave the system proxy settings alone.
    #[arg(long)]
    no_set_system_proxy: bool,
    #[arg(long, value_enum, default_value = "sr")]
    profile: Profile,
    /// Private server host replacing the profile default.
    #[arg(long, env = "SERVER_ADDRESS")]
    server_address: Option<String>,
    #[arg(long, env = "SERVER_PORT")]
    server_port: Option<u16>,
    #[arg(long, env = "USE_SSL", value_parser = clap::builder::BoolishValueParser::new())]
    use_ssl: Option<bool>,
    /// TOML file with a full proxy configuration. Command-line flags win.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding the root CA and generated leaf certificates.
    #[arg(long)]
    certs_dir: Option<PathBuf>,
    /// Default log level; RUST_LOG overrides it.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = build_config(&cli)?;
    let host = config.listen.host.clone();
    let redirect_ports = config.redirect_ports.clone();
    let (mut server, events) = ProxyServer::new(config).context("failed to prepare proxy")?;
    let event_task = tokio::spawn(log_events(events));

    info!("starting proxy");
    let addr = server.start().await.context("failed to start proxy")?;
    let platform = Platform::detect().await;

    info!("checking root certificate installation");
    ensure_certificate(&platform, probe_addr(addr)).await;

    let mut proxy_set = false;
    if !cli.no_set_system_proxy {
        info!("setting system proxy");
        match platform
            .set_system_proxy(&host, addr.port(), &redirect_ports)
            .await
        {
            Ok(()) => proxy_set = true,
            Err(err) => error!(error = %err, "failed to set system proxy"),
        }
    }

    info!(addr = %addr, "proxy started, press Ctrl+C to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }

    if proxy_set {
        info!("unsetting system proxy");
        if let Err(err) = platform
            .unset_system_proxy(&host, addr.port(), &redirect_ports)
            .await
        {
            error!(error = %err, "failed to unset system proxy");
        }
    }

    info!("stopping proxy");
    let report = server.stop().await.context("failed to stop proxy")?;
    drop(server);
    let _ = event_task.await;
    info!(forced = report.forced, "proxy stopped");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "crepe_proxy={level},crepe_net={level},crepe_proxy_cli={level}"
        ))
    })?;
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .context("failed to initialize tracing subscriber")?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if let Some(address) = &cli.address {
        let (host, port) = parse_address(address)?;
        config.listen.host = host;
        if let Some(port) = port {
            config.listen.port = port;
        }
    }
    if let Some(ip) = &cli.ip {
        config.listen.host = ip.clone();
    }
    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if let Some(dir) = &cli.certs_dir {
        config.tls.ca_cert_dir = dir.to_string_lossy().into_owned();
        config.tls.leaf_cert_dir = dir.join("leaf").to_string_lossy().into_owned();
    }

    // Rules written in the config file replace the profile's.
    if config.rules.rules.is_empty() {
        let server = ServerTarget {
            host: cli.server_address.clone(),
            port: cli.server_port,
            use_ssl: cli.use_ssl,
        };
        config.rules = RuleSet::for_profile(cli.profile.into(), &server);
    }
    Ok(config)
}

fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Splits `host[:port]`; IPv6 hosts must be bracketed to carry a port.
fn parse_address(address: &str) -> Result<(String, Option<u16>)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            bail!("unterminated IPv6 address in {address:?}");
        };
        (host, tail.strip_prefix(':'))
    } else if let Some((host, port)) = address
        .split_once(':')
        .filter(|(_, port)| !port.contains(':'))
    {
        (host, Some(port))
    } else {
        (address, None)
    };
    if host.is_empty() {
        bail!("missing host in {address:?}");
    }
    let port = port
        .map(|port| port.parse::<u16>())
        .transpose()
        .with_context(|| format!("invalid port in {address:?}"))?;
    Ok((host.to_string(), port))
}

/// The probe cannot dial a wildcard address; use loopback instead.
fn probe_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), v4.port())
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), v6.port())
        }
        other => other,
    }
}

async fn ensure_certificate(platform: &impl SystemIntegration, addr: SocketAddr) {
    match probe::ca_trusted(addr, PROBE_HOST).await {
        Ok(true) => info!("root certificate already installed"),
        Ok(false) => {
            info!("root certificate not installed, installing");
            match install_certificate(platform, addr).await {
                Ok(()) => info!("root certificate installed"),
                Err(err) => error!(error = %format!("{err:#}"), "failed to install root certificate"),
            }
        }
        Err(err) => warn!(error = %err, "could not check root certificate installation"),
    }
}

async fn install_certificate(platform: &impl SystemIntegration, addr: SocketAddr) -> Result<()> {
    let format = platform.certificate_format();
    let bytes = probe::fetch_root_certificate(addr, format)
        .await
        .context("failed to download root certificate")?;
    let path = std::env::temp_dir().join(format!(
        "crepe-proxy-{}-{}",
        std::process::id(),
        format.file_name()
    ));
    std::fs::write(&path, &bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    debug!(path = %path.display(), "certificate file");
    let result = platform.install_certificate(&path).await;
    if let Err(err) = std::fs::remove_file(&path) {
        debug!(error = %err, path = %path.display(), "failed to remove certificate file");
    }
    result.context("trust store rejected the certificate")
}

async fn log_events(mut events: ProxyEvents) {
    use tokio_stream::StreamExt;

    while let Some(event) = events.next().await {
        debug!(session = %event.session_id, kind = ?event.kind, "proxy event");
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use clap::Parser;
    use crepe_proxy::{Decision, Redirect, RuleEngine, Scheme};

    use super::{Cli, build_config, parse_address, probe_addr};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("crepe-proxy").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn parses_listen_addresses() {
        assert_eq!(
            parse_address("0.0.0.0:8080").expect("address"),
            ("0.0.0.0".to_string(), Some(8080))
        );
        assert_eq!(
            parse_address("localhost").expect("address"),
            ("localhost".to_string(), None)
        );
        assert_eq!(
            parse_address("[::1]:9000").expect("address"),
            ("::1".to_string(), Some(9000))
        );
        assert_eq!(parse_address("::1").expect("address"), ("::1".to_string(), None));
        assert!(parse_address("127.0.0.1:http").is_err());
        assert!(parse_address(":8080").is_err());
    }

    #[test]
    fn flags_override_address() {
        let cli = parse(&["--address", "0.0.0.0:9000", "--port", "9001"]);
        let config = build_config(&cli).expect("config");
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 9001);
        assert_eq!(config.redirect_ports, vec![80, 443]);
    }

    #[test]
    fn profile_and_server_build_rules() {
        let cli = parse(&[
            "--profile",
            "ys",
            "--server-address",
            "ps.example.net",
            "--server-port",
            "8443",
            "--use-ssl",
            "false",
        ]);
        let config = build_config(&cli).expect("config");
        let engine = RuleEngine::new(&config.rules);
        assert_eq!(
            engine.evaluate("hk4e-api.mihoyo.com"),
            Decision::Redirect(Redirect {
                host: "ps.example.net".to_string(),
                port: Some(8443),
                scheme: Some(Scheme::Http),
            })
        );
        assert_eq!(engine.evaluate("example.com"), Decision::Pass);
    }

    #[test]
    fn config_file_rules_win_over_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proxy.toml");
        std::fs::write(
            &path,
            r#"
            [listen]
            port = 20000

            [[rules]]
            suffixes = ["example.org"]
            target_host = "127.0.0.1"
            action = "redirect"
            "#,
        )
        .expect("write config");
        let certs = dir.path().join("certs");
        let cli = parse(&[
            "--config",
            path.to_str().expect("utf-8 path"),
            "--certs-dir",
            certs.to_str().expect("utf-8 path"),
        ]);
        let config = build_config(&cli).expect("config");
        assert_eq!(config.listen.port, 20000);
        assert_eq!(config.rules.rules.len(), 1);
        assert!(config.tls.leaf_cert_dir.ends_with("leaf"));
    }

    #[test]
    fn wildcard_listeners_are_probed_on_loopback() {
        let addr: SocketAddr = "0.0.0.0:13168".parse().expect("addr");
        assert_eq!(probe_addr(addr), "127.0.0.1:13168".parse().expect("addr"));
        let addr: SocketAddr = "192.168.1.2:13168".parse().expect("addr");
        assert_eq!(probe_addr(addr), addr);
    }
}
