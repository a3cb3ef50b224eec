//! Path-to-upstream resolution
//!
//! Rules are scanned in configuration order and the first rule whose path is
//! a literal prefix of the request URL wins, regardless of how specific later
//! rules are. Only the first upstream id of the matched rule is ever used.

use crate::config::{RuleConfig, ServerConfig, UpstreamConfig};
use crate::error::ProxyErrorCode;
use std::collections::HashMap;

/// Why a URL could not be resolved to an upstream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no rule matches url {url:?}")]
    RulesNotFound { url: String },
    #[error("rule {rule_path:?} references unknown upstream {upstream_id:?}")]
    UpstreamNotFound { rule_path: String, upstream_id: String },
}

impl RouteError {
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            RouteError::RulesNotFound { .. } => ProxyErrorCode::RulesNotFound,
            RouteError::UpstreamNotFound { .. } => ProxyErrorCode::UpstreamNotFound,
        }
    }
}

/// A resolved route: the matching rule and its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub rule: &'a RuleConfig,
    pub upstream: &'a UpstreamConfig,
}

/// Immutable routing table built from the server configuration
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RuleConfig>,
    upstreams: HashMap<String, UpstreamConfig>,
}

impl RouteTable {
    pub fn new(rules: Vec<RuleConfig>, upstreams: Vec<UpstreamConfig>) -> Self {
        let mut by_id = HashMap::with_capacity(upstreams.len());
        for upstream in upstreams {
            // first definition wins if validation was skipped
            by_id.entry(upstream.id.clone()).or_insert(upstream);
        }

        Self {
            rules,
            upstreams: by_id,
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(server.rules.clone(), server.upstreams.clone())
    }

    /// Find the first rule matching `url`, in configuration order
    pub fn match_rule(&self, url: &str) -> Option<&RuleConfig> {
        self.rules.iter().find(|rule| rule.matches(url))
    }

    pub fn upstream(&self, id: &str) -> Option<&UpstreamConfig> {
        self.upstreams.get(id)
    }

    /// Resolve `url` to the upstream it should be proxied to
    pub fn resolve(&self, url: &str) -> Result<Route<'_>, RouteError> {
        let rule = self.match_rule(url).ok_or_else(|| RouteError::RulesNotFound {
            url: url.to_string(),
        })?;

        let upstream_id = rule.upstreams.first().map(String::as_str).unwrap_or_default();

        let upstream = self
            .upstream(upstream_id)
            .ok_or_else(|| RouteError::UpstreamNotFound {
                rule_path: rule.path.clone(),
                upstream_id: upstream_id.to_string(),
            })?;

        Ok(Route { rule, upstream })
    }
}
