use serde::{Deserialize, Serialize};

use crate::rules::{Rule, RuleSet, Scheme};

const STAR_RAIL_SUFFIXES: &[&str] = &[
    ".yuanshen.com",
    ".hoyoverse.com",
    ".mihoyo.com",
    "starrails.com",
    ".kurogame.com",
    "zenlesszonezero.com",
    "api.g3.proletariat.com",
    "west.honkaiimpact3.com",
];
const STAR_RAIL_HOST: &str = "sr.crepe.moe";
const STAR_RAIL_BLOCKED: &str = "overseauspider.yuanshen.com";

const GENSHIN_SUFFIXES: &[&str] = &[".mihoyo.com", ".yuanshen.com", ".hoyoverse.com"];
const GENSHIN_HOST: &str = "game.grasscutter.io";
const GENSHIN_PORT: u16 = 443;

/// Which game's endpoints get redirected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GameProfile {
    #[default]
    StarRail,
    Genshin,
}

/// User overrides for the redirect destination. Unset fields fall back to the
/// profile's own defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub use_ssl: Option<bool>,
}

impl ServerTarget {
    fn scheme(&self) -> Option<Scheme> {
        self.use_ssl
            .map(|ssl| if ssl { Scheme::Https } else { Scheme::Http })
    }
}

impl GameProfile {
    pub fn default_host(self) -> &'static str {
        match self {
            GameProfile::StarRail => STAR_RAIL_HOST,
            GameProfile::Genshin => GENSHIN_HOST,
        }
    }
}

impl RuleSet {
    pub fn for_profile(profile: GameProfile, server: &ServerTarget) -> Self {
        let host = server
            .host
            .as_deref()
            .filter(|host| !host.is_empty())
            .unwrap_or(profile.default_host());

        match profile {
            GameProfile::StarRail => RuleSet::new(vec![
                Rule::block([STAR_RAIL_BLOCKED]),
                Rule::redirect(STAR_RAIL_SUFFIXES.iter().copied(), host)
                    .with_port(server.port)
                    .with_scheme(server.scheme()),
            ]),
            // Port and scheme are always forced so the official OAuth flow lands on
            // the private server.
            GameProfile::Genshin => RuleSet::new(vec![
                Rule::redirect(GENSHIN_SUFFIXES.iter().copied(), host)
                    .with_port(Some(server.port.unwrap_or(GENSHIN_PORT)))
                    .with_scheme(Some(server.scheme().unwrap_or(Scheme::Https))),
            ]),
        }
    }
}
