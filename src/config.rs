use crate::balancer::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// Port the coordinator listens on
    pub listen: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Number of worker routers (default: number of CPUs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Routing rules, checked in order; the first matching prefix wins
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Upstream targets referenced by rules
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Deadline in seconds for a single dispatch, including the upstream call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Worker selection strategy (default: random)
    #[serde(default)]
    pub balance: SelectionStrategy,
}

/// A path-prefix rule mapping requests to upstreams
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    /// Path prefix the request URL must start with
    pub path: String,

    /// Upstream ids; only the first one is used
    pub upstreams: Vec<String>,
}

/// A named upstream target
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    /// Unique identifier referenced by rules
    pub id: String,

    /// Host to forward to, e.g. "localhost:9000" or "http://10.0.0.5:8080"
    pub url: String,
}

impl RuleConfig {
    pub fn new(path: &str, upstreams: &[&str]) -> Self {
        Self {
            path: path.to_string(),
            upstreams: upstreams.iter().map(|u| u.to_string()).collect(),
        }
    }

    /// Whether this rule applies to the given request URL
    pub fn matches(&self, url: &str) -> bool {
        url.starts_with(&self.path)
    }
}

impl UpstreamConfig {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
        }
    }
}

impl ServerConfig {
    /// Number of workers to spawn, falling back to the host CPU count
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.listen)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}:{}': {}", self.bind, self.listen, e))
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.listen == 0 {
            errors.push("server.listen must be a non-zero port".to_string());
        }

        if self.workers == Some(0) {
            errors.push("server.workers must be at least 1".to_string());
        }

        if self.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be at least 1".to_string());
        }

        for (i, rule) in self.rules.iter().enumerate() {
            if !rule.path.starts_with('/') {
                errors.push(format!(
                    "server.rules[{}]: path '{}' must start with '/'",
                    i, rule.path
                ));
            }
            if rule.upstreams.is_empty() {
                errors.push(format!(
                    "server.rules[{}]: at least one upstream is required",
                    i
                ));
            }
        }

        // Rule references are resolved per request, not here
        let mut seen = HashSet::new();
        for (i, upstream) in self.upstreams.iter().enumerate() {
            if upstream.id.is_empty() {
                errors.push(format!("server.upstreams[{}]: id must not be empty", i));
            } else if !seen.insert(upstream.id.as_str()) {
                errors.push(format!(
                    "server.upstreams[{}]: duplicate id '{}'",
                    i, upstream.id
                ));
            }
            if upstream.url.is_empty() {
                errors.push(format!("server.upstreams[{}]: url must not be empty", i));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for a dispatch to complete
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl Config {
    /// Load and validate a config file. `.toml` files are parsed as TOML,
    /// everything else as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            Self::from_toml_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(errors) = self.server.validate() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCENARIO_YAML: &str = r#"
server:
  listen: 8080
  workers: 1
  rules:
    - path: /svc
      upstreams: [u1]
  upstreams:
    - id: u1
      url: localhost:9000
"#;

    #[test]
    fn test_parse_yaml_config() {
        let config = Config::from_yaml_str(SCENARIO_YAML).unwrap();
        assert_eq!(config.server.listen, 8080);
        assert_eq!(config.server.workers, Some(1));
        assert_eq!(config.server.rules, vec![RuleConfig::new("/svc", &["u1"])]);
        assert_eq!(
            config.server.upstreams,
            vec![UpstreamConfig::new("u1", "localhost:9000")]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
[server]
listen = 8080
bind = "127.0.0.1"
request_timeout_secs = 5
balance = "round-robin"

[[server.rules]]
path = "/api"
upstreams = ["api", "api-backup"]

[[server.upstreams]]
id = "api"
url = "127.0.0.1:3000"
"#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.balance, SelectionStrategy::RoundRobin);
        assert_eq!(config.server.rules[0].upstreams, vec!["api", "api-backup"]);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml_str("server:\n  listen: 80\n").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.workers, None);
        assert!(config.server.worker_count() >= 1);
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.server.balance, SelectionStrategy::Random);
        assert!(config.server.rules.is_empty());
        assert!(config.server.upstreams.is_empty());
    }

    #[test]
    fn test_worker_count_explicit() {
        let config = Config::from_yaml_str(SCENARIO_YAML).unwrap();
        assert_eq!(config.server.worker_count(), 1);
    }

    #[test]
    fn test_missing_listen_is_rejected() {
        assert!(Config::from_yaml_str("server:\n  workers: 2\n").is_err());
    }

    #[test]
    fn test_rule_matches_prefix() {
        let rule = RuleConfig::new("/api", &["a"]);
        assert!(rule.matches("/api"));
        assert!(rule.matches("/api/v2/items"));
        assert!(rule.matches("/apiary"));
        assert!(!rule.matches("/ap"));
        assert!(!rule.matches("/other/api"));
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = Config::from_yaml_str(SCENARIO_YAML).unwrap();
        config.server.workers = Some(0);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.workers must be at least 1"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let yaml = r#"
server:
  listen: 0
  request_timeout_secs: 0
  rules:
    - path: svc
      upstreams: []
  upstreams:
    - id: a
      url: ""
    - id: a
      url: localhost:1
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        let errors = config.server.validate().unwrap_err();
        assert_eq!(errors.len(), 6, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("non-zero port")));
        assert!(errors.iter().any(|e| e.contains("must start with '/'")));
        assert!(errors.iter().any(|e| e.contains("at least one upstream")));
        assert!(errors.iter().any(|e| e.contains("duplicate id 'a'")));
        assert!(errors.iter().any(|e| e.contains("url must not be empty")));
    }

    #[test]
    fn test_validate_does_not_check_rule_references() {
        let yaml = r#"
server:
  listen: 8080
  rules:
    - path: /x
      upstreams: [missing]
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_addr() {
        let mut config = Config::from_yaml_str(SCENARIO_YAML).unwrap();
        config.server.bind = "127.0.0.1".to_string();
        assert_eq!(
            config.server.bind_addr().unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );

        config.server.bind = "not an ip".to_string();
        assert!(config.server.bind_addr().is_err());
    }

    #[test]
    fn test_json_roundtrip_for_workers() {
        let config = Config::from_yaml_str(SCENARIO_YAML).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();

        let yaml_path = dir.path().join("proxy.yaml");
        std::fs::File::create(&yaml_path)
            .unwrap()
            .write_all(SCENARIO_YAML.as_bytes())
            .unwrap();
        assert_eq!(Config::load(&yaml_path).unwrap().server.listen, 8080);

        let toml_path = dir.path().join("proxy.toml");
        std::fs::write(&toml_path, "[server]\nlisten = 9090\n").unwrap();
        assert_eq!(Config::load(&toml_path).unwrap().server.listen, 9090);

        let invalid_path = dir.path().join("invalid.yml");
        std::fs::write(&invalid_path, "server:\n  listen: 8080\n  workers: 0\n").unwrap();
        assert!(Config::load(&invalid_path).is_err());

        assert!(Config::load(dir.path().join("missing.yaml")).is_err());
    }
}
