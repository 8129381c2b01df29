mod config;
mod error;
mod events;
mod export;
mod http;
mod intercept;
mod listener;
pub mod probe;
mod profile;
mod relay;
mod rules;
mod server;
mod session;
mod upstream;

pub use config::{ListenConfig, ProxyConfig, ShutdownConfig, TlsMitmConfig, UpstreamConfig};
pub use error::ProxyError;
pub use events::{EventSink, ProxyEvent, ProxyEventKind, ProxyEvents, event_channel};
pub use export::{CertFormat, PROXY_HOST, export_response};
pub use profile::{GameProfile, ServerTarget};
pub use relay::{RelayEnd, RelayStats, relay, relay_bounded};
pub use rules::{
    Decision, Redirect, Rule, RuleAction, RuleEngine, RuleSet, Scheme, Target, normalize_host,
};
pub use server::{ProxyServer, ServerState, StopReport};
pub use session::{Session, SessionState};
pub use upstream::{AsyncStream, BoxedStream, UpstreamConnector};
