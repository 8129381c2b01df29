use std::time::Duration;

use crepe_net::{DEFAULT_LEAF_VALIDITY_DAYS, TlsConfig};
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;
use crate::rules::RuleSet;

/// Snapshot taken by [`crate::ProxyServer::start`]; the running server never
/// observes later edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub tls: TlsMitmConfig,
    pub upstream: UpstreamConfig,
    pub rules: RuleSet,
    pub shutdown: ShutdownConfig,
    /// Destination ports the OS integration steers into the proxy.
    pub redirect_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Bound on each client read before the request head is complete, the
    /// client TLS handshake included.
    #[serde(with = "duration_secs")]
    pub client_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsMitmConfig {
    pub allow_legacy: bool,
    pub ca_common_name: String,
    pub ca_cert_dir: String,
    pub leaf_cert_dir: String,
    pub leaf_validity_days: u32,
    pub leaf_cache_capacity: usize,
    /// When false, CONNECT tunnels to hosts no rule matches are relayed
    /// without decryption.
    pub intercept_passthrough: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Accept any certificate presented by the upstream server.
    pub insecure: bool,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        if self.listen.host.contains(':') && !self.listen.host.starts_with('[') {
            format!("[{}]:{}", self.listen.host, self.listen.port)
        } else {
            format!("{}:{}", self.listen.host, self.listen.port)
        }
    }

    pub fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            allow_legacy: self.tls.allow_legacy,
            upstream_insecure: self.upstream.insecure,
        }
    }

    /// Rejects values the server cannot start with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.listen.host.trim().is_empty() {
            return Err(ProxyError::Config("listen host is empty".to_string()));
        }
        if self.tls.leaf_validity_days == 0 {
            return Err(ProxyError::Config(
                "leaf certificate validity must be at least one day".to_string(),
            ));
        }
        if self.tls.leaf_cache_capacity == 0 {
            return Err(ProxyError::Config(
                "leaf cache capacity must be non-zero".to_string(),
            ));
        }
        if self.redirect_ports.contains(&0) {
            return Err(ProxyError::Config("port 0 cannot be redirected".to_string()));
        }
        for rule in &self.rules.rules {
            if rule.suffixes.is_empty() {
                return Err(ProxyError::Config("rule without suffixes".to_string()));
            }
            if rule.action == crate::rules::RuleAction::Redirect
                && rule.target_host.trim().is_empty()
            {
                return Err(ProxyError::Config(
                    "redirect rule without a target host".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            tls: TlsMitmConfig::default(),
            upstream: UpstreamConfig::default(),
            rules: RuleSet::default(),
            shutdown: ShutdownConfig::default(),
            redirect_ports: vec![80, 443],
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 13168,
            client_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for TlsMitmConfig {
    fn default() -> Self {
        Self {
            allow_legacy: false,
            ca_common_name: "Crepe Proxy CA".to_string(),
            ca_cert_dir: "certs".to_string(),
            leaf_cert_dir: "certs/leaf".to_string(),
            leaf_validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
            leaf_cache_capacity: 1024,
            intercept_passthrough: true,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            insecure: true,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
