//! Node identity and cluster size
//!
//! Every master names its per-node status znode after its node id, which is
//! either configured or taken from the host's IP detection script. The
//! number of masters is read from a file installed with the host.

use crate::error::{UiUpdateError, UiUpdateResult};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed node id; detected when unset
    pub id: Option<String>,
    /// Prints this master's IP address on stdout
    pub detect_ip_command: PathBuf,
    /// Holds the number of masters
    pub master_count_file: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            detect_ip_command: PathBuf::from("/opt/mesosphere/bin/detect_ip"),
            master_count_file: PathBuf::from("/opt/mesosphere/etc/master_count"),
        }
    }
}

impl NodeConfig {
    pub async fn node_id(&self) -> UiUpdateResult<String> {
        match &self.id {
            Some(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
            _ => detect_ip(&self.detect_ip_command).await.map(|ip| ip.to_string()),
        }
    }

    pub async fn master_count(&self) -> UiUpdateResult<usize> {
        read_master_count(&self.master_count_file).await
    }
}

/// Run `command` and parse its output as an IP address
pub async fn detect_ip(command: &Path) -> UiUpdateResult<IpAddr> {
    let output = Command::new(command).output().await.map_err(|e| {
        UiUpdateError::ConfigurationError {
            component: "node".to_string(),
            message: format!("running {}: {}", command.display(), e),
        }
    })?;
    if !output.status.success() {
        return Err(UiUpdateError::ConfigurationError {
            component: "node".to_string(),
            message: format!(
                "{} exited with {}: {}",
                command.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    let stdout = String::from_utf8(output.stdout)?;
    let ip = stdout.trim().parse::<IpAddr>()?;
    debug!(ip = %ip, "detected node address");
    Ok(ip)
}

/// Read the master count from `path`
pub async fn read_master_count(path: &Path) -> UiUpdateResult<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| UiUpdateError::ConfigurationError {
            component: "node".to_string(),
            message: format!("reading master count from {}: {}", path.display(), e),
        })?;
    let count = raw.trim().parse::<usize>()?;
    if count == 0 {
        return Err(UiUpdateError::ConfigurationError {
            component: "node".to_string(),
            message: format!("master count in {} must be at least 1", path.display()),
        });
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("detect_ip");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_configured_id_wins() {
        let config = NodeConfig {
            id: Some(" master-1 ".to_string()),
            detect_ip_command: PathBuf::from("/nonexistent"),
            ..NodeConfig::default()
        };
        assert_eq!(config.node_id().await.unwrap(), "master-1");
    }

    #[tokio::test]
    #[serial]
    async fn test_detect_ip() {
        let dir = TempDir::new().unwrap();
        let config = NodeConfig {
            detect_ip_command: script(&dir, "echo ' 10.0.4.17 '"),
            ..NodeConfig::default()
        };
        assert_eq!(config.node_id().await.unwrap(), "10.0.4.17");
    }

    #[tokio::test]
    #[serial]
    async fn test_detect_ip_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        assert!(detect_ip(&script(&dir, "echo not-an-ip")).await.is_err());
        assert!(detect_ip(&script(&dir, "exit 3")).await.is_err());
    }

    #[tokio::test]
    async fn test_master_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("master_count");

        std::fs::write(&path, "3\n").unwrap();
        assert_eq!(read_master_count(&path).await.unwrap(), 3);

        std::fs::write(&path, "0").unwrap();
        assert!(read_master_count(&path).await.is_err());

        std::fs::write(&path, "three").unwrap();
        assert!(read_master_count(&path).await.is_err());

        assert!(read_master_count(&dir.path().join("missing")).await.is_err());
    }
}
