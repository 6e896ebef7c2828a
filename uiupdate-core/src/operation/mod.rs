//! Cluster-wide reset and update operations
//!
//! An operation is driven through the `cluster-status` znode by a single
//! [`OperationLeader`] (the master that accepted the request) while every
//! master, the leader included, takes part as an [`OperationFollower`] by
//! advertising its own phase under `node-status/<node id>`.
//!
//! ```text
//! cluster:  Requested -> InProgress -> Complete -> Idle
//!                             \-> Failed --------/
//! ```
//!
//! The transition rules live in pure functions
//! ([`leader::next_cluster_state`], [`follower::next_node_state`]); the
//! coordination writes happen around them.

pub mod follower;
pub mod leader;
pub mod status;

pub use follower::{next_node_state, FollowerEffect, LocalOperations, OperationFollower};
pub use leader::{next_cluster_state, OperationLeader, StatusCounts};
pub use status::{Operation, OperationState, OperationStatus};

use crate::error::UiUpdateResult;
use crate::retry::RetryConfig;
use crate::zk::{NodeKind, Permissions, ZkClient};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and retry parameters shared by leader and followers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Absolute deadline of an operation, counted from its start
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Re-read interval of the status watchers
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Attempts for a status write before the operation fails
    pub write_retry_attempts: u32,
    /// Attempts for creating the status nodes
    pub init_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(6 * 60),
            poll_interval: Duration::from_secs(30),
            write_retry_attempts: 3,
            init_retry_attempts: 10,
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl OperationConfig {
    pub(crate) fn write_retry(&self, operation_name: &str) -> RetryConfig {
        RetryConfig::fixed(
            operation_name,
            self.write_retry_attempts,
            self.retry_interval,
        )
    }

    pub(crate) fn init_retry(&self, operation_name: &str) -> RetryConfig {
        RetryConfig::fixed(operation_name, self.init_retry_attempts, self.retry_interval)
    }
}

/// Write `value` to `path`, creating the node with `kind` if it is missing
pub(crate) async fn put_value(
    client: &dyn ZkClient,
    path: &str,
    value: &[u8],
    kind: NodeKind,
) -> UiUpdateResult<()> {
    match client.set(path, value).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_no_node() => {
            match client.create(path, value, Permissions::All, kind).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_node_exists() => client.set(path, value).await.map(|_| ()),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zk::MemoryEnsemble;

    #[tokio::test]
    async fn test_put_value_creates_then_overwrites() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();

        put_value(client.as_ref(), "/base/x", b"1", NodeKind::Persistent)
            .await
            .unwrap();
        put_value(client.as_ref(), "/base/x", b"2", NodeKind::Persistent)
            .await
            .unwrap();
        assert_eq!(ensemble.value_string("/base/x").unwrap(), "2");
    }

    #[test]
    fn test_default_config() {
        let config = OperationConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(360));
        assert_eq!(config.write_retry("w").max_attempts, 3);
        assert_eq!(config.init_retry("i").max_attempts, 10);
    }
}
