//! Server configuration: TOML file + CLI overrides.
//!
//! The `[auth_tokens]` table doubles as the token store's backing file: a
//! bootstrap token generated on a cold start is written back into it.

use crate::auth::TokenSource;
use mcp_core::{McpError, McpResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub broker: BrokerSection,
    /// token → comma-separated permission labels
    #[serde(default)]
    pub auth_tokens: BTreeMap<String, String>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub auth_enabled: bool,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_enabled: true,
            max_clients: default_max_clients(),
        }
    }
}

/// `[broker]` section: dispatch and connection timing.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            read_timeout_secs: default_read_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    5555
}
fn default_max_clients() -> usize {
    10
}
fn default_command_timeout() -> u64 {
    30
}
fn default_read_timeout() -> u64 {
    60
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_cache_ttl() -> u64 {
    600
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub no_auth: bool,
    pub max_clients: Option<usize>,
    pub command_timeout_secs: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth_enabled: bool,
    pub max_clients: usize,
    /// Deadline for one command's round trip through the EA.
    pub command_timeout: Duration,
    /// Per-read socket timeout; expiry only triggers an idle check.
    pub read_timeout: Duration,
    /// Inactivity after which a connection is dropped.
    pub idle_timeout: Duration,
    /// Eviction horizon for unclaimed EA replies.
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    /// File the configuration came from (and bootstrap tokens go to).
    pub config_path: Option<PathBuf>,
    pub auth_tokens: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), None)
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file yields defaults; an unreadable or malformed one is an error.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> McpResult<Self> {
        let expanded = config_path.map(expand_tilde);

        let file_config = match &expanded {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| McpError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::from_file(file_config, expanded);

        // Merge CLI overrides
        if let Some(host) = overrides.host {
            config.host = host;
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if overrides.no_auth {
            config.auth_enabled = false;
        }
        if let Some(max) = overrides.max_clients {
            config.max_clients = max;
        }
        if let Some(secs) = overrides.command_timeout_secs {
            config.command_timeout = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }

    fn from_file(file: ConfigFile, config_path: Option<PathBuf>) -> Self {
        Self {
            host: file.server.host,
            port: file.server.port,
            auth_enabled: file.server.auth_enabled,
            max_clients: file.server.max_clients,
            command_timeout: Duration::from_secs(file.broker.command_timeout_secs.max(1)),
            read_timeout: Duration::from_secs(file.broker.read_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(file.broker.idle_timeout_secs),
            cache_ttl: Duration::from_secs(file.broker.cache_ttl_secs),
            sweep_interval: Duration::from_secs(file.broker.sweep_interval_secs.max(1)),
            config_path,
            auth_tokens: file.auth_tokens,
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Token source backed by this configuration's file.
    pub fn token_source(&self) -> FileTokenSource {
        FileTokenSource {
            path: self.config_path.clone(),
            tokens: self.auth_tokens.clone(),
        }
    }
}

/// Tokens read from the config file; new tokens are appended to its `[auth_tokens]` table.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: Option<PathBuf>,
    tokens: BTreeMap<String, String>,
}

impl TokenSource for FileTokenSource {
    fn load(&self) -> McpResult<BTreeMap<String, String>> {
        Ok(self.tokens.clone())
    }

    fn persist(&self, token: &str, permissions: &str) -> McpResult<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| McpError::Config("no config file to persist tokens to".into()))?;
        persist_token(path, token, permissions)
    }
}

/// Insert `token = permissions` into the file's `[auth_tokens]` table,
/// creating the file if needed and keeping every other section intact.
pub fn persist_token(path: &Path, token: &str, permissions: &str) -> McpResult<()> {
    let mut doc = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        content
            .parse::<toml::Table>()
            .map_err(|e| McpError::Config(format!("config parse error: {e}")))?
    } else {
        toml::Table::new()
    };

    let tokens = doc
        .entry("auth_tokens")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(tokens) = tokens else {
        return Err(McpError::Config("`auth_tokens` is not a table".into()));
    };
    tokens.insert(token.to_string(), toml::Value::String(permissions.to_string()));

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let rendered = toml::to_string_pretty(&doc)
        .map_err(|e| McpError::Config(format!("config serialize error: {e}")))?;
    std::fs::write(path, rendered)?;
    Ok(())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 5555);
        assert!(cfg.auth_enabled);
        assert_eq!(cfg.max_clients, 10);
        assert_eq!(cfg.command_timeout, Duration::from_secs(30));
        assert_eq!(cfg.read_timeout, Duration::from_secs(60));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.cache_ttl, Duration::from_secs(600));
        assert!(cfg.auth_tokens.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
host = "0.0.0.0"
port = 6000
auth_enabled = false

[broker]
command_timeout_secs = 5

[auth_tokens]
"tok-1" = "all"
"tok-2" = "read,trade"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cfg = ServerConfig::from_file(file, None);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:6000");
        assert!(!cfg.auth_enabled);
        assert_eq!(cfg.max_clients, 10);
        assert_eq!(cfg.command_timeout, Duration::from_secs(5));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.auth_tokens.get("tok-2").map(String::as_str), Some("read,trade"));
    }

    #[test]
    fn zero_timeouts_are_raised_to_one_second() {
        let toml_str = r#"
[broker]
command_timeout_secs = 0
read_timeout_secs = 0
sweep_interval_secs = 0
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cfg = ServerConfig::from_file(file, None);
        assert_eq!(cfg.command_timeout, Duration::from_secs(1));
        assert_eq!(cfg.read_timeout, Duration::from_secs(1));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));

        let cfg = ServerConfig::load(
            None,
            ConfigOverrides {
                command_timeout_secs: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.command_timeout, Duration::from_secs(1));
    }

    #[test]
    fn missing_file_uses_defaults_and_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = ServerConfig::load(
            Some(&path),
            ConfigOverrides {
                port: Some(7000),
                no_auth: true,
                max_clients: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.port, 7000);
        assert!(!cfg.auth_enabled);
        assert_eq!(cfg.max_clients, 3);
        assert_eq!(cfg.config_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, McpError::Config(_)));
    }

    #[test]
    fn persist_token_keeps_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 6100\n").unwrap();

        persist_token(&path, "fresh-token", "all").unwrap();

        let cfg = ServerConfig::load(Some(&path), ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.port, 6100);
        assert_eq!(cfg.auth_tokens.get("fresh-token").map(String::as_str), Some("all"));
    }

    #[test]
    fn persist_token_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let source = FileTokenSource {
            path: Some(path.clone()),
            tokens: BTreeMap::new(),
        };
        source.persist("t", "all").unwrap();
        let file: ConfigFile = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.auth_tokens.get("t").map(String::as_str), Some("all"));
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde_str("/etc/mcp.toml"), PathBuf::from("/etc/mcp.toml"));
    }
}
