//! Agent configuration
//!
//! Loaded from a TOML file whose sections all have defaults, then overridden
//! from `UIUPDATE_*` environment variables, then validated.
//!
//! ```toml
//! [zookeeper]
//! address = "zk-1.zk:2181,zk-2.zk:2181"
//! base_path = "/dcos/ui-update"
//! session_timeout = "5s"
//!
//! [operation]
//! timeout = "6m"
//! ```

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::manager::UiPaths;
use crate::node::NodeConfig;
use crate::operation::OperationConfig;
use crate::registry::RegistryConfig;
use crate::zk::{normalize_base_path, ConnectOptions};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "UIUPDATE_";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node: NodeConfig,
    pub http: HttpConfig,
    pub ui: UiPaths,
    pub registry: RegistryConfig,
    pub zookeeper: ZookeeperConfig,
    pub operation: OperationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Used unless a socket is handed over by the service manager
    pub listen_address: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([127, 0, 0, 1], 16000)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZookeeperConfig {
    /// Comma separated `host:port` list
    pub address: String,
    pub base_path: String,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Re-read interval of the version watcher
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// `scheme:owner` credentials
    pub auth: Option<String>,
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2181".to_string(),
            base_path: "/dcos/ui-update".to_string(),
            session_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            auth: None,
        }
    }
}

impl ZookeeperConfig {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            address: self.address.clone(),
            base_path: self.base_path.clone(),
            session_timeout: self.session_timeout,
            connect_timeout: self.connect_timeout,
            auth: self.auth.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load `path`, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> UiUpdateResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> UiUpdateResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| UiUpdateError::ConfigurationError {
            component: "config".to_string(),
            message: format!("reading {}: {}", path.display(), e),
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> UiUpdateResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override settings from `UIUPDATE_*` variables
    pub fn apply_env(&mut self) -> UiUpdateResult<()> {
        if let Some(id) = env_string("NODE_ID") {
            self.node.id = Some(id);
        }
        if let Some(path) = env_string("MASTER_COUNT_FILE") {
            self.node.master_count_file = PathBuf::from(path);
        }
        if let Some(address) = env_parse("LISTEN_ADDRESS")? {
            self.http.listen_address = address;
        }
        if let Some(path) = env_string("VERSIONS_ROOT") {
            self.ui.versions_root = PathBuf::from(path);
        }
        if let Some(path) = env_string("DEFAULT_DOC_ROOT") {
            self.ui.default_doc_root = PathBuf::from(path);
        }
        if let Some(path) = env_string("DIST_SYMLINK") {
            self.ui.dist_symlink = PathBuf::from(path);
        }
        if let Some(path) = env_string("DIST_STAGE_SYMLINK") {
            self.ui.dist_stage_symlink = PathBuf::from(path);
        }
        if let Some(url) = env_string("REGISTRY_URL") {
            self.registry.url = url;
        }
        if let Some(name) = env_string("PACKAGE_NAME") {
            self.registry.package_name = name;
        }
        if let Some(address) = env_string("ZK_ADDRESS") {
            self.zookeeper.address = address;
        }
        if let Some(base_path) = env_string("ZK_BASE_PATH") {
            self.zookeeper.base_path = base_path;
        }
        if let Some(timeout) = env_duration("ZK_SESSION_TIMEOUT")? {
            self.zookeeper.session_timeout = timeout;
        }
        if let Some(timeout) = env_duration("ZK_CONNECT_TIMEOUT")? {
            self.zookeeper.connect_timeout = timeout;
        }
        if let Some(interval) = env_duration("ZK_POLL_INTERVAL")? {
            self.zookeeper.poll_interval = interval;
        }
        if let Some(timeout) = env_duration("OPERATION_TIMEOUT")? {
            self.operation.timeout = timeout;
        }
        if let Some(level) = env_string("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> UiUpdateResult<()> {
        self.ui.validate()?;
        normalize_base_path(&self.zookeeper.base_path)?;

        if self.zookeeper.address.trim().is_empty() {
            return Err(invalid("zookeeper", "address must not be empty"));
        }
        let timeouts = [
            ("zookeeper.session_timeout", self.zookeeper.session_timeout),
            ("zookeeper.connect_timeout", self.zookeeper.connect_timeout),
            ("zookeeper.poll_interval", self.zookeeper.poll_interval),
            ("registry.request_timeout", self.registry.request_timeout),
            ("operation.timeout", self.operation.timeout),
            ("operation.poll_interval", self.operation.poll_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(invalid("timeouts", &format!("{} must be non-zero", name)));
            }
        }
        if self.operation.write_retry_attempts == 0 || self.operation.init_retry_attempts == 0 {
            return Err(invalid("operation", "retry attempts must be at least 1"));
        }
        if self.registry.package_name.is_empty() {
            return Err(invalid("registry", "package_name must not be empty"));
        }
        Ok(())
    }
}

fn invalid(component: &str, message: &str) -> UiUpdateError {
    UiUpdateError::ConfigurationError {
        component: component.to_string(),
        message: message.to_string(),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(key: &str) -> UiUpdateResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                invalid("environment", &format!("invalid {}{}: {}", ENV_PREFIX, key, e))
            })
        })
        .transpose()
}

fn env_duration(key: &str) -> UiUpdateResult<Option<Duration>> {
    env_string(key)
        .map(|raw| {
            humantime_serde::re::humantime::parse_duration(&raw).map_err(|e| {
                invalid("environment", &format!("invalid {}{}: {}", ENV_PREFIX, key, e))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        AgentConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AgentConfig::from_toml(
            r#"
            [zookeeper]
            address = "zk-1:2181,zk-2:2181"
            session_timeout = "10s"

            [operation]
            timeout = "2m"

            [ui]
            versions_root = "/var/lib/ui/versions"
            "#,
        )
        .unwrap();

        assert_eq!(config.zookeeper.address, "zk-1:2181,zk-2:2181");
        assert_eq!(config.zookeeper.session_timeout, Duration::from_secs(10));
        assert_eq!(config.zookeeper.base_path, ZookeeperConfig::default().base_path);
        assert_eq!(config.operation.timeout, Duration::from_secs(120));
        assert_eq!(config.operation.write_retry_attempts, 3);
        assert_eq!(config.ui.versions_root, PathBuf::from("/var/lib/ui/versions"));
        assert_eq!(config.registry, RegistryConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_unparsable_file() {
        assert!(AgentConfig::from_toml("[zookeeper]\nsession_timeout = 5").is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AgentConfig::default();
        config.zookeeper.base_path = "relative".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.ui.versions_root = PathBuf::from("/");
        assert!(matches!(
            config.validate(),
            Err(UiUpdateError::PotentiallyDangerousVersionsRoot { .. })
        ));

        let mut config = AgentConfig::default();
        config.operation.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("UIUPDATE_ZK_ADDRESS", "zk.example:2181");
        std::env::set_var("UIUPDATE_OPERATION_TIMEOUT", "90s");
        std::env::set_var("UIUPDATE_NODE_ID", "10.0.0.5");

        let mut config = AgentConfig::default();
        let applied = config.apply_env();

        std::env::remove_var("UIUPDATE_ZK_ADDRESS");
        std::env::remove_var("UIUPDATE_OPERATION_TIMEOUT");
        std::env::remove_var("UIUPDATE_NODE_ID");

        applied.unwrap();
        assert_eq!(config.zookeeper.address, "zk.example:2181");
        assert_eq!(config.operation.timeout, Duration::from_secs(90));
        assert_eq!(config.node.id.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    #[serial]
    fn test_invalid_environment_value() {
        std::env::set_var("UIUPDATE_ZK_SESSION_TIMEOUT", "soon");
        let mut config = AgentConfig::default();
        let applied = config.apply_env();
        std::env::remove_var("UIUPDATE_ZK_SESSION_TIMEOUT");

        assert!(applied.is_err());
    }
}
