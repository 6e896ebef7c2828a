//! Children-node target

use super::{WatchTarget, WatchUpdate, Watcher};
use crate::error::{UiUpdateError, UiUpdateResult};
use crate::zk::{EventReceiver, ZkClient};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Observes the child names of an existing node
///
/// Lists are compared positionally, so a reorder is reported like an add or
/// a remove.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildrenTarget;

#[async_trait]
impl WatchTarget for ChildrenTarget {
    type Value = Vec<String>;

    async fn initial(&self, client: &dyn ZkClient, path: &str) -> UiUpdateResult<Vec<String>> {
        let exists = client
            .exists(path)
            .await
            .map_err(|e| UiUpdateError::FailedToReadNode {
                path: path.to_string(),
                source: Box::new(e),
            })?;
        if exists.is_none() {
            return Err(UiUpdateError::NodeDoesNotExist {
                path: path.to_string(),
            });
        }
        client
            .children(path)
            .await
            .map(|(children, _)| children)
            .map_err(|e| UiUpdateError::FailedToReadNode {
                path: path.to_string(),
                source: Box::new(e),
            })
    }

    async fn read(&self, client: &dyn ZkClient, path: &str) -> UiUpdateResult<Vec<String>> {
        client.children(path).await.map(|(children, _)| children)
    }

    async fn arm(
        &self,
        client: &dyn ZkClient,
        path: &str,
    ) -> UiUpdateResult<(Vec<String>, EventReceiver)> {
        let (children, _, events) = client.children_watch(path).await?;
        Ok((children, events))
    }
}

impl Watcher<ChildrenTarget> {
    /// Watch the children of `path`, which must exist
    pub async fn create(
        client: Arc<dyn ZkClient>,
        path: &str,
        poll_timeout: Duration,
        listener: mpsc::Sender<WatchUpdate<Vec<String>>>,
    ) -> UiUpdateResult<Self> {
        Self::start(ChildrenTarget, client, path, poll_timeout, listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::ChildrenWatcher;
    use crate::zk::{ensure_path, MemoryEnsemble, NodeKind, Permissions};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const POLL: Duration = Duration::from_secs(60);

    fn names(children: &[&str]) -> Vec<String> {
        children.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_reorder_is_a_change() {
        let shared: crate::watcher::Shared<<ChildrenTarget as WatchTarget>::Value> =
            crate::watcher::Shared {
                value: parking_lot::Mutex::new(names(&["a", "b"])),
            };
        assert!(shared.replace(&names(&["b", "a"])));
        assert!(!shared.replace(&names(&["b", "a"])));
        assert!(shared.replace(&names(&["b"])));
        assert!(shared.replace(&names(&["b", "c"])));
    }

    #[tokio::test]
    async fn test_requires_existing_node() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let err = ChildrenWatcher::create(client, "/base/node-status", POLL, tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UiUpdateError::NodeDoesNotExist { .. }));
    }

    #[tokio::test]
    async fn test_reports_added_and_removed_children() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        ensure_path(client.as_ref(), "/base/node-status").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let watcher = ChildrenWatcher::create(client.clone(), "/base/node-status", POLL, tx)
            .await
            .unwrap();
        assert!(watcher.value().is_empty());

        client
            .create(
                "/base/node-status/a",
                b"",
                Permissions::All,
                NodeKind::Ephemeral,
            )
            .await
            .unwrap();
        let update = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(update.path, "/base/node-status");
        assert_eq!(update.value, vec!["a".to_string()]);

        client.delete("/base/node-status/a", None).await.unwrap();
        let update = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(update.value.is_empty());
    }

    #[tokio::test]
    async fn test_data_changes_of_children_are_not_reported() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        ensure_path(client.as_ref(), "/base/node-status/a")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _watcher = ChildrenWatcher::create(client.clone(), "/base/node-status", POLL, tx)
            .await
            .unwrap();

        client.set("/base/node-status/a", b"x").await.unwrap();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }
}
