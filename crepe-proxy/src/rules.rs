use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Redirect,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub suffixes: BTreeSet<String>,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub scheme_override: Option<Scheme>,
    pub action: RuleAction,
}

impl Rule {
    pub fn redirect<I, S>(suffixes: I, target_host: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffixes: suffixes.into_iter().map(Into::into).collect(),
            target_host: target_host.to_string(),
            target_port: None,
            scheme_override: None,
            action: RuleAction::Redirect,
        }
    }

    pub fn block<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            suffixes: suffixes.into_iter().map(Into::into).collect(),
            target_host: String::new(),
            target_port: None,
            scheme_override: None,
            action: RuleAction::Block,
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.target_port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: Option<Scheme>) -> Self {
        self.scheme_override = scheme;
        self
    }
}

/// Ordered rule list as configured. Declaration order is the priority order
/// among rules of the same action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }
}

/// Where a request ends up after rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub host: String,
    pub port: Option<u16>,
    pub scheme: Option<Scheme>,
}

impl Redirect {
    /// Applies the redirect to the original destination: unset port and scheme
    /// are inherited from it.
    pub fn resolve(&self, original: &Target) -> Target {
        Target {
            host: self.host.clone(),
            port: self.port.unwrap_or(original.port),
            scheme: self.scheme.unwrap_or(original.scheme),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Pass,
    Redirect(Redirect),
    Block,
}

impl Decision {
    pub fn resolve(&self, original: &Target) -> Option<Target> {
        match self {
            Decision::Pass => Some(original.clone()),
            Decision::Redirect(redirect) => Some(redirect.resolve(original)),
            Decision::Block => None,
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    suffixes: Vec<String>,
    decision: Decision,
}

/// Read-only after construction; clones share the compiled rules.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: Arc<[CompiledRule]>,
}

impl RuleEngine {
    pub fn new(rule_set: &RuleSet) -> Self {
        let mut rules: Vec<CompiledRule> = rule_set
            .rules
            .iter()
            .map(|rule| CompiledRule {
                suffixes: rule
                    .suffixes
                    .iter()
                    .map(|suffix| suffix.trim().trim_matches('.').to_ascii_lowercase())
                    .filter(|suffix| !suffix.is_empty())
                    .collect(),
                decision: match rule.action {
                    RuleAction::Block => Decision::Block,
                    RuleAction::Redirect => Decision::Redirect(Redirect {
                        host: rule.target_host.clone(),
                        port: rule.target_port,
                        scheme: rule.scheme_override,
                    }),
                },
            })
            .collect();
        // Block rules short-circuit every redirect; the sort is stable.
        rules.sort_by_key(|rule| !matches!(rule.decision, Decision::Block));

        Self {
            rules: rules.into(),
        }
    }

    /// Malformed host names pass through untouched.
    pub fn evaluate(&self, hostname: &str) -> Decision {
        match self.try_evaluate(hostname) {
            Ok(decision) => decision,
            Err(err) => {
                debug!(error = %err, "passing through unevaluable host");
                Decision::Pass
            }
        }
    }

    pub fn try_evaluate(&self, hostname: &str) -> Result<Decision, ProxyError> {
        let host = normalize_host(hostname)?;
        Ok(self
            .rules
            .iter()
            .find(|rule| {
                rule.suffixes
                    .iter()
                    .any(|suffix| matches_suffix(&host, suffix))
            })
            .map(|rule| rule.decision.clone())
            .unwrap_or(Decision::Pass))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Lowercases and validates a host name, dropping a trailing root dot.
pub fn normalize_host(hostname: &str) -> Result<String, ProxyError> {
    let invalid = |reason: &str| ProxyError::RuleEvaluation {
        host: hostname.to_string(),
        reason: reason.to_string(),
    };

    let host = hostname.trim().trim_end_matches('.');
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    if host.len() > 253 {
        return Err(invalid("host longer than 253 bytes"));
    }
    let valid = host
        .bytes()
        .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b':' | b'[' | b']'));
    if !valid {
        return Err(invalid("host contains invalid characters"));
    }
    if host.split('.').any(str::is_empty) {
        return Err(invalid("empty label"));
    }
    Ok(host.to_ascii_lowercase())
}

fn matches_suffix(host: &str, suffix: &str) -> bool {
    if host == suffix {
        return true;
    }
    host.len() > suffix.len()
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Decision, Redirect, Rule, RuleEngine, RuleSet, Scheme, Target};

    fn engine() -> RuleEngine {
        RuleEngine::new(&RuleSet::new(vec![
            Rule::redirect([".yuanshen.com", ".mihoyo.com", "starrails.com"], "sr.crepe.moe"),
            Rule::block(["overseauspider.yuanshen.com"]),
        ]))
    }

    fn redirect_to(host: &str) -> Decision {
        Decision::Redirect(Redirect {
            host: host.to_string(),
            port: None,
            scheme: None,
        })
    }

    #[test]
    fn matches_case_insensitively() {
        let engine = engine();
        assert_eq!(engine.evaluate("GAME.MiHoYo.com"), redirect_to("sr.crepe.moe"));
        assert_eq!(engine.evaluate("game.mihoyo.com"), redirect_to("sr.crepe.moe"));
    }

    #[test]
    fn suffix_match_respects_label_boundary() {
        let engine = engine();
        assert_eq!(engine.evaluate("notyuanshen.com"), Decision::Pass);
        assert_eq!(engine.evaluate("notstarrails.com"), Decision::Pass);
        assert_eq!(engine.evaluate("api.starrails.com"), redirect_to("sr.crepe.moe"));
        assert_eq!(engine.evaluate("starrails.com"), redirect_to("sr.crepe.moe"));
    }

    #[test]
    fn unmatched_hosts_pass() {
        assert_eq!(engine().evaluate("google.com"), Decision::Pass);
    }

    #[test]
    fn block_short_circuits_redirect() {
        let engine = engine();
        assert_eq!(engine.evaluate("overseauspider.yuanshen.com"), Decision::Block);
        assert_eq!(engine.evaluate("OverseaUSpider.YuanShen.com."), Decision::Block);
        assert_eq!(engine.evaluate("log-upload.yuanshen.com"), redirect_to("sr.crepe.moe"));
    }

    #[test]
    fn first_declared_redirect_wins() {
        let engine = RuleEngine::new(&RuleSet::new(vec![
            Rule::redirect([".mihoyo.com"], "first.example"),
            Rule::redirect(["sdk-static.mihoyo.com"], "second.example"),
        ]));
        assert_eq!(engine.evaluate("sdk-static.mihoyo.com"), redirect_to("first.example"));
    }

    #[test]
    fn malformed_hosts_pass_through() {
        let engine = engine();
        assert_eq!(engine.evaluate("bad host.mihoyo.com"), Decision::Pass);
        assert_eq!(engine.evaluate(""), Decision::Pass);
        assert_matches!(
            engine.try_evaluate("a..mihoyo.com"),
            Err(crate::ProxyError::RuleEvaluation { .. })
        );
    }

    #[test]
    fn redirect_inherits_unset_port_and_scheme() {
        let original = Target {
            host: "sdk-static.mihoyo.com".to_string(),
            port: 443,
            scheme: Scheme::Https,
        };
        let inherit = Redirect {
            host: "sr.crepe.moe".to_string(),
            port: None,
            scheme: None,
        };
        assert_eq!(
            inherit.resolve(&original),
            Target {
                host: "sr.crepe.moe".to_string(),
                port: 443,
                scheme: Scheme::Https,
            }
        );

        let forced = Redirect {
            host: "127.0.0.1".to_string(),
            port: Some(21000),
            scheme: Some(Scheme::Http),
        };
        assert_eq!(forced.resolve(&original).to_string(), "http://127.0.0.1:21000");
    }
}
