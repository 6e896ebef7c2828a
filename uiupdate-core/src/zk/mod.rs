//! Coordination service client abstraction
//!
//! Components depend on the [`ZkClient`] trait rather than on a concrete
//! connection, which lets the same watchers and state machines run against a
//! real ZooKeeper ensemble ([`ZkConnection`]) or the in-process
//! [`MemoryEnsemble`].
//!
//! Connection state is reduced to two values, [`ClientState::Connected`] and
//! [`ClientState::Disconnected`], and fanned out to keyed listeners. A
//! listener receives the current state as soon as it is registered and then
//! every transition.

pub mod connection;
pub mod layout;
pub mod listeners;
pub mod memory;

pub use connection::{ConnectOptions, ZkConnection};
pub use layout::ZnodeLayout;
pub use listeners::StateListeners;
pub use memory::{MemoryClient, MemoryEnsemble};

use crate::error::{UiUpdateError, UiUpdateResult, ZkErrorCode};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// User-visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

/// One-shot notification delivered to a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The session dropped while the watch was pending
    Disconnected,
    /// The watch was removed without a node change
    NotWatching,
}

/// Receiving side of a one-shot watch
pub type EventReceiver = oneshot::Receiver<WatchEvent>;

/// Metadata of a znode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Data version, bumped on every set
    pub version: i32,
    /// Children version, bumped on every child create or delete
    pub cversion: i32,
    /// Session owning the node, 0 for persistent nodes
    pub ephemeral_owner: i64,
}

/// Lifetime of a created znode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Persistent,
    /// Removed by the service when the creating session ends
    Ephemeral,
}

/// Access granted on a created znode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    /// Every permission for everyone
    All,
    /// Every permission for the authenticated creator only
    CreatorAll,
}

/// Operations the agent needs from the coordination service
#[async_trait]
pub trait ZkClient: Send + Sync {
    /// Normalised base path all agent znodes live under
    fn base_path(&self) -> &str;

    /// Current connection state
    fn client_state(&self) -> ClientState;

    /// Register a state listener under `id`, replacing any listener with the same id
    ///
    /// The current state is sent immediately, then every transition.
    fn register_listener(&self, id: &str, listener: mpsc::UnboundedSender<ClientState>);

    fn unregister_listener(&self, id: &str);

    async fn exists(&self, path: &str) -> UiUpdateResult<Option<NodeStat>>;

    /// Like [`ZkClient::exists`] and leaves a watch that fires on create, change or delete
    async fn exists_watch(&self, path: &str) -> UiUpdateResult<(Option<NodeStat>, EventReceiver)>;

    async fn get(&self, path: &str) -> UiUpdateResult<(Vec<u8>, NodeStat)>;

    async fn get_watch(&self, path: &str) -> UiUpdateResult<(Vec<u8>, NodeStat, EventReceiver)>;

    async fn children(&self, path: &str) -> UiUpdateResult<(Vec<String>, NodeStat)>;

    async fn children_watch(
        &self,
        path: &str,
    ) -> UiUpdateResult<(Vec<String>, NodeStat, EventReceiver)>;

    async fn create(
        &self,
        path: &str,
        value: &[u8],
        permissions: Permissions,
        kind: NodeKind,
    ) -> UiUpdateResult<()>;

    /// Compare-and-set against an explicit version
    async fn set_versioned(&self, path: &str, value: &[u8], version: i32)
        -> UiUpdateResult<NodeStat>;

    async fn delete(&self, path: &str, version: Option<i32>) -> UiUpdateResult<()>;

    async fn close(&self);

    /// Compare-and-set against the node's current version
    ///
    /// A version conflict between the read and the write is retried once.
    async fn set(&self, path: &str, value: &[u8]) -> UiUpdateResult<NodeStat> {
        let mut retried = false;
        loop {
            let stat = self
                .exists(path)
                .await?
                .ok_or_else(|| UiUpdateError::coordination("set", path, ZkErrorCode::NoNode))?;
            match self.set_versioned(path, value, stat.version).await {
                Err(e) if e.is_bad_version() && !retried => retried = true,
                other => return other,
            }
        }
    }
}

/// Validate and normalise a configured base path
///
/// The path must be absolute; a trailing `/` is dropped.
pub fn normalize_base_path(base_path: &str) -> UiUpdateResult<String> {
    if !base_path.starts_with('/') {
        return Err(UiUpdateError::ConfigurationError {
            component: "zookeeper".to_string(),
            message: format!("base path '{}' must start with '/'", base_path),
        });
    }
    let trimmed = base_path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(UiUpdateError::ConfigurationError {
            component: "zookeeper".to_string(),
            message: "base path must not be the root node".to_string(),
        });
    }
    if trimmed.split('/').skip(1).any(|segment| segment.is_empty()) {
        return Err(UiUpdateError::ConfigurationError {
            component: "zookeeper".to_string(),
            message: format!("base path '{}' contains an empty segment", base_path),
        });
    }
    Ok(trimmed.to_string())
}

/// Every ancestor of `path` followed by `path` itself, shallowest first
pub(crate) fn path_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

/// Create `path` and every missing ancestor as persistent nodes
pub async fn ensure_path(client: &dyn ZkClient, path: &str) -> UiUpdateResult<()> {
    for prefix in path_prefixes(path) {
        if client.exists(&prefix).await?.is_some() {
            continue;
        }
        match client
            .create(&prefix, &[], Permissions::All, NodeKind::Persistent)
            .await
        {
            Ok(()) => tracing::debug!(path = %prefix, "created znode"),
            Err(e) if e.is_node_exists() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path("/dcos/ui").unwrap(), "/dcos/ui");
        assert_eq!(normalize_base_path("/dcos/ui/").unwrap(), "/dcos/ui");
        assert!(normalize_base_path("dcos/ui").is_err());
        assert!(normalize_base_path("/").is_err());
        assert!(normalize_base_path("/dcos//ui").is_err());
    }

    #[test]
    fn test_path_prefixes() {
        assert_eq!(
            path_prefixes("/a/b/c"),
            vec!["/a".to_string(), "/a/b".to_string(), "/a/b/c".to_string()]
        );
        assert!(path_prefixes("/").is_empty());
    }
}
