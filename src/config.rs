//! Configuration parsing and validation.
//!
//! Forrst is configured via a TOML file (default: `./config/forrst.toml`).
//! Every section is optional; defaults match the values below.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7433"
//! path = "/rpc"
//! expose_internal_errors = false
//!
//! [limits]
//! request_max_bytes = 1048576      # 1 MiB
//! response_max_bytes = 10485760    # 10 MiB
//!
//! [deadline]
//! default_ms = 0                   # 0 = no server default
//!
//! [operations]
//! ttl_seconds = 86400
//! sweep_interval_seconds = 60
//!
//! [node]
//! id = ""                          # "" = hostname
//!
//! [quota]
//! enabled = false
//! limit = 120
//! window_seconds = 60
//!
//! [idempotency]
//! ttl_seconds = 600
//!
//! [reserved]
//! namespaces = ["urn:forrst:", "urn:cline:"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub deadline: DeadlineConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub reserved: ReservedConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Expose internal failure causes in error details. Keep off in
    /// production.
    #[serde(default)]
    pub expose_internal_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            path: default_path(),
            expose_internal_errors: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7433".to_string()
}

fn default_path() -> String {
    "/rpc".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_request_max_bytes")]
    pub request_max_bytes: usize,
    #[serde(default = "default_response_max_bytes")]
    pub response_max_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_max_bytes: default_request_max_bytes(),
            response_max_bytes: default_response_max_bytes(),
        }
    }
}

fn default_request_max_bytes() -> usize {
    1024 * 1024
}

fn default_response_max_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeadlineConfig {
    /// Server-default deadline applied when a request declares none.
    /// Zero disables the default.
    #[serde(default)]
    pub default_ms: u64,
}

impl DeadlineConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        (self.default_ms > 0).then(|| Duration::from_millis(self.default_ms))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OperationsConfig {
    #[serde(default = "default_operation_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_operation_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_operation_ttl() -> u64 {
    86400
}

fn default_sweep_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NodeConfig {
    /// Node identifier stamped into `meta.node`. Empty = hostname.
    #[serde(default)]
    pub id: String,
}

impl NodeConfig {
    /// The effective node id: configured value, else hostname, else a
    /// fixed fallback.
    pub fn resolved_id(&self) -> String {
        if !self.id.is_empty() {
            return self.id.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "forrst-node".to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_quota_limit")]
    pub limit: u64,
    #[serde(default = "default_quota_window")]
    pub window_seconds: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: default_quota_limit(),
            window_seconds: default_quota_window(),
        }
    }
}

fn default_quota_limit() -> u64 {
    120
}

fn default_quota_window() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_idempotency_ttl(),
        }
    }
}

fn default_idempotency_ttl() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReservedConfig {
    #[serde(default = "default_reserved_namespaces")]
    pub namespaces: Vec<String>,
}

impl Default for ReservedConfig {
    fn default() -> Self {
        Self {
            namespaces: default_reserved_namespaces(),
        }
    }
}

fn default_reserved_namespaces() -> Vec<String> {
    vec!["urn:forrst:".to_string(), "urn:cline:".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.server.bind.parse::<std::net::SocketAddr>().is_err() {
        anyhow::bail!("server.bind '{}' is not a socket address", config.server.bind);
    }
    if !config.server.path.starts_with('/') {
        anyhow::bail!("server.path must start with '/'");
    }
    if config.limits.request_max_bytes == 0 {
        anyhow::bail!("limits.request_max_bytes must be > 0");
    }
    if config.limits.response_max_bytes < config.limits.request_max_bytes {
        anyhow::bail!("limits.response_max_bytes must be >= limits.request_max_bytes");
    }
    if config.operations.ttl_seconds == 0 {
        anyhow::bail!("operations.ttl_seconds must be > 0");
    }
    if config.operations.sweep_interval_seconds == 0 {
        anyhow::bail!("operations.sweep_interval_seconds must be > 0");
    }
    if config.quota.enabled && config.quota.limit == 0 {
        anyhow::bail!("quota.limit must be > 0 when quota is enabled");
    }
    for namespace in &config.reserved.namespaces {
        if !namespace.starts_with("urn:") {
            anyhow::bail!("reserved namespace '{namespace}' must start with 'urn:'");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("forrst.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let (_dir, path) = write_config("");
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7433");
        assert_eq!(config.limits.request_max_bytes, 1024 * 1024);
        assert_eq!(config.operations.ttl_seconds, 86400);
        assert!(!config.quota.enabled);
        assert_eq!(
            config.reserved.namespaces,
            vec!["urn:forrst:", "urn:cline:"]
        );
    }

    #[test]
    fn test_partial_override() {
        let (_dir, path) = write_config(
            r#"
[server]
bind = "0.0.0.0:8080"

[deadline]
default_ms = 5000
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(
            config.deadline.default_deadline(),
            Some(Duration::from_millis(5000))
        );
        assert_eq!(config.server.path, "/rpc");
    }

    #[test]
    fn test_validation_failures() {
        let (_dir, path) = write_config("[server]\nbind = \"not-an-addr\"\n");
        assert!(load_config(&path).is_err());

        let (_dir, path) = write_config("[limits]\nrequest_max_bytes = 0\n");
        assert!(load_config(&path).is_err());

        let (_dir, path) = write_config("[reserved]\nnamespaces = [\"forrst:\"]\n");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_node_id_fallback() {
        let node = NodeConfig { id: "node-7".into() };
        assert_eq!(node.resolved_id(), "node-7");
        assert!(!NodeConfig::default().resolved_id().is_empty());
    }
}
