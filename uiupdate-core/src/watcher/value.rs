//! Value-node target

use super::{WatchTarget, WatchUpdate, Watcher};
use crate::error::{UiUpdateError, UiUpdateResult};
use crate::zk::{EventReceiver, ZkClient};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Data and data version of a node
///
/// A missing node is represented by empty data and no version. Two values
/// differ when either the bytes or the version differ, so rewriting the same
/// bytes is still observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeValue {
    pub data: Vec<u8>,
    pub version: Option<i32>,
}

impl NodeValue {
    pub fn exists(&self) -> bool {
        self.version.is_some()
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Observes a single node, present or not
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueTarget;

async fn read_value(client: &dyn ZkClient, path: &str) -> UiUpdateResult<NodeValue> {
    if client.exists(path).await?.is_none() {
        return Ok(NodeValue::default());
    }
    match client.get(path).await {
        Ok((data, stat)) => Ok(NodeValue {
            data,
            version: Some(stat.version),
        }),
        Err(e) if e.is_no_node() => Ok(NodeValue::default()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl WatchTarget for ValueTarget {
    type Value = NodeValue;

    async fn initial(&self, client: &dyn ZkClient, path: &str) -> UiUpdateResult<NodeValue> {
        read_value(client, path)
            .await
            .map_err(|e| UiUpdateError::FailedToReadNode {
                path: path.to_string(),
                source: Box::new(e),
            })
    }

    async fn read(&self, client: &dyn ZkClient, path: &str) -> UiUpdateResult<NodeValue> {
        read_value(client, path).await
    }

    async fn arm(
        &self,
        client: &dyn ZkClient,
        path: &str,
    ) -> UiUpdateResult<(NodeValue, EventReceiver)> {
        let (stat, events) = client.exists_watch(path).await?;
        if stat.is_none() {
            return Ok((NodeValue::default(), events));
        }
        // The exists watch also covers data changes and deletion.
        let value = match client.get(path).await {
            Ok((data, stat)) => NodeValue {
                data,
                version: Some(stat.version),
            },
            Err(e) if e.is_no_node() => NodeValue::default(),
            Err(e) => return Err(e),
        };
        Ok((value, events))
    }
}

impl Watcher<ValueTarget> {
    /// Watch the value of `path`, polling every `poll_timeout`
    pub async fn create(
        client: Arc<dyn ZkClient>,
        path: &str,
        poll_timeout: Duration,
        listener: mpsc::Sender<WatchUpdate<NodeValue>>,
    ) -> UiUpdateResult<Self> {
        Self::start(ValueTarget, client, path, poll_timeout, listener).await
    }

    /// Last observed data
    pub fn data(&self) -> Vec<u8> {
        self.value().data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::NodeWatcher;
    use crate::zk::{MemoryEnsemble, NodeKind, Permissions};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const POLL: Duration = Duration::from_secs(60);

    async fn next(rx: &mut mpsc::Receiver<WatchUpdate<NodeValue>>) -> NodeValue {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().value
    }

    #[tokio::test]
    async fn test_missing_node_starts_empty() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let watcher = NodeWatcher::create(client, "/base/v", POLL, tx).await.unwrap();
        assert_eq!(watcher.value(), NodeValue::default());
        assert_eq!(watcher.path(), "/base/v");
        assert!(watcher.data().is_empty());
    }

    #[tokio::test]
    async fn test_reports_create_change_and_delete() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let _watcher = NodeWatcher::create(client.clone(), "/base/v", POLL, tx)
            .await
            .unwrap();

        client
            .create("/base/v", b"1", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap();
        let value = next(&mut rx).await;
        assert_eq!(value.data, b"1");
        assert_eq!(value.version, Some(0));

        client.set("/base/v", b"2").await.unwrap();
        assert_eq!(next(&mut rx).await.data, b"2");

        client.delete("/base/v", None).await.unwrap();
        assert_eq!(next(&mut rx).await, NodeValue::default());
    }

    #[tokio::test]
    async fn test_same_bytes_new_version_is_reported() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        ensemble.put("/base/v", b"same").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _watcher = NodeWatcher::create(client.clone(), "/base/v", POLL, tx)
            .await
            .unwrap();

        client.set("/base/v", b"same").await.unwrap();
        let value = next(&mut rx).await;
        assert_eq!(value.data, b"same");
        assert_eq!(value.version, Some(1));
    }

    #[tokio::test]
    async fn test_rejects_closed_listener_and_disconnected_client() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = NodeWatcher::create(client.clone(), "/base/v", POLL, tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UiUpdateError::ListenerNotProvided { .. }));

        client.disconnect();
        let (tx, _rx) = mpsc::channel(1);
        let err = NodeWatcher::create(client.clone(), "/base/v", POLL, tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, UiUpdateError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_rearms_after_reconnect() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = NodeWatcher::create(client.clone(), "/base/v", POLL, tx)
            .await
            .unwrap();

        client.disconnect();
        ensemble.put("/base/v", b"while-away").unwrap();
        client.reconnect();

        assert_eq!(next(&mut rx).await.data, b"while-away");
        assert_eq!(watcher.data(), b"while-away");
    }

    #[tokio::test]
    async fn test_close_unregisters_listener() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let watcher = NodeWatcher::create(client.clone(), "/base/v", POLL, tx)
            .await
            .unwrap();
        assert_eq!(client.listener_count(), 1);

        watcher.shutdown().await;
        assert!(watcher.is_closed());
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_sees_writes_from_other_sessions() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let _watcher = NodeWatcher::create(
            client.clone(),
            "/base/v",
            Duration::from_millis(50),
            tx,
        )
        .await
        .unwrap();

        let writer = ensemble.connect("/base").await.unwrap();
        writer
            .create("/base/v", b"x", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await.data, b"x");
    }
}
