//! Configuration module for relaymeter
//!
//! YAML configuration: an API section, the data file path, and one entry per
//! forwarded proxy.
//!
//! ```yaml
//! api:
//!   port: 8080
//!   token: "secret"
//! data_file: ./traffic_data.json
//! proxies:
//!   - name: web
//!     listen_port: 8001
//!     target_host: 10.0.0.5
//!     target_port: 80
//!     protocol: tcp
//!     limit: "100GB"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stats::{parse_bytes, Protocol};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Path of the counter data file
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,

    /// Proxy entries
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen port for the read-only stats API
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token; empty disables authentication
    #[serde(default)]
    pub token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            token: String::new(),
        }
    }
}

/// One forwarded proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEntry {
    /// Unique name; counters are keyed by it across restarts
    pub name: String,

    /// Local port to listen on
    pub listen_port: u16,

    /// Upstream host
    #[serde(default = "default_target_host")]
    pub target_host: String,

    /// Upstream port
    pub target_port: u16,

    /// tcp, udp, or both
    #[serde(default)]
    pub protocol: Protocol,

    /// Total traffic cap, e.g. "100GB" or "1.5TB"; "" or "0" = unlimited
    #[serde(default)]
    pub limit: String,

    /// Monthly traffic cap, same format
    #[serde(default)]
    pub limit_monthly: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_file() -> PathBuf {
    PathBuf::from("./traffic_data.json")
}

fn default_target_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for proxy in &self.proxies {
            if proxy.name.is_empty() {
                return Err(Error::Config("Proxy name must not be empty".to_string()));
            }
            if !names.insert(proxy.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate proxy name: {}",
                    proxy.name
                )));
            }
            if proxy.listen_port == 0 {
                return Err(Error::Config(format!(
                    "Proxy {}: listen_port is required",
                    proxy.name
                )));
            }
            if proxy.target_port == 0 {
                return Err(Error::Config(format!(
                    "Proxy {}: target_port is required",
                    proxy.name
                )));
            }
            proxy.limit_bytes().map_err(|_| {
                Error::Config(format!(
                    "Proxy {}: invalid limit {:?}",
                    proxy.name, proxy.limit
                ))
            })?;
            proxy.limit_monthly_bytes().map_err(|_| {
                Error::Config(format!(
                    "Proxy {}: invalid limit_monthly {:?}",
                    proxy.name, proxy.limit_monthly
                ))
            })?;
        }
        Ok(())
    }
}

impl ProxyEntry {
    /// Total cap in bytes; 0 = unlimited
    pub fn limit_bytes(&self) -> Result<u64> {
        parse_bytes(&self.limit)
    }

    /// Monthly cap in bytes; 0 = unlimited
    pub fn limit_monthly_bytes(&self) -> Result<u64> {
        parse_bytes(&self.limit_monthly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_yaml(
            r#"
proxies:
  - name: web
    listen_port: 8001
    target_port: 80
"#,
        )
        .unwrap();

        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.token, "");
        assert_eq!(config.data_file, PathBuf::from("./traffic_data.json"));
        let proxy = &config.proxies[0];
        assert_eq!(proxy.target_host, "127.0.0.1");
        assert_eq!(proxy.protocol, Protocol::Tcp);
        assert_eq!(proxy.limit_bytes().unwrap(), 0);
    }

    #[test]
    fn test_full_entry() {
        let config = Config::from_yaml(
            r#"
api:
  port: 9090
  token: secret
data_file: /var/lib/relaymeter/data.json
proxies:
  - name: game
    listen_port: 25001
    target_host: 10.0.0.9
    target_port: 25002
    protocol: both
    limit: "100GB"
    limit_monthly: "10 GB"
"#,
        )
        .unwrap();

        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.token, "secret");
        let proxy = &config.proxies[0];
        assert_eq!(proxy.protocol, Protocol::Both);
        assert_eq!(proxy.limit_bytes().unwrap(), 100 * 1024 * 1024 * 1024);
        assert_eq!(proxy.limit_monthly_bytes().unwrap(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result = Config::from_yaml(
            r#"
proxies:
  - name: web
    listen_port: 8001
    target_port: 80
    protocol: sctp
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let result = Config::from_yaml(
            r#"
proxies:
  - name: web
    listen_port: 8001
    target_port: 80
  - name: web
    listen_port: 8002
    target_port: 81
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_limit_rejected() {
        let result = Config::from_yaml(
            r#"
proxies:
  - name: web
    listen_port: 8001
    target_port: 80
    limit: "lots"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        assert!(Config::from_yaml("proxies:\n  - name: web\n    listen_port: 8001\n").is_err());
    }
}
