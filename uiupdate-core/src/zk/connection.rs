//! ZooKeeper-backed coordination client
//!
//! The `zookeeper` crate exposes a blocking API, so every request runs on the
//! blocking pool. Session events arrive on the default watcher and are reduced
//! to [`ClientState`] before being fanned out to listeners.

use super::{
    ensure_path, normalize_base_path, ClientState, EventReceiver, NodeKind, NodeStat, Permissions,
    StateListeners, WatchEvent, ZkClient,
};
use crate::error::{UiUpdateError, UiUpdateResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use zookeeper::{
    Acl, CreateMode, KeeperState, Stat, WatchedEvent, WatchedEventType, Watcher, ZkError,
    ZooKeeper,
};

/// Parameters for [`ZkConnection::connect`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Comma separated `host:port` list
    pub address: String,
    pub base_path: String,
    pub session_timeout: Duration,
    /// Upper bound for establishing the first session
    pub connect_timeout: Duration,
    /// Credentials as `scheme:owner`
    pub auth: Option<String>,
}

/// Maps session events onto [`ClientState`]
struct SessionWatcher {
    listeners: Arc<StateListeners>,
    initialized: Mutex<Option<oneshot::Sender<()>>>,
}

impl Watcher for SessionWatcher {
    fn handle(&self, event: WatchedEvent) {
        if !matches!(event.event_type, WatchedEventType::None) {
            return;
        }
        match event.keeper_state {
            KeeperState::SyncConnected | KeeperState::ConnectedReadOnly => {
                self.listeners.transition(ClientState::Connected);
                if let Some(initialized) = self.initialized.lock().take() {
                    let _ = initialized.send(());
                }
            }
            KeeperState::Disconnected | KeeperState::Expired | KeeperState::AuthFailed => {
                if self.listeners.transition(ClientState::Disconnected) {
                    warn!(state = ?event.keeper_state, "coordination session lost");
                }
            }
            other => debug!(state = ?other, "ignoring session event"),
        }
    }
}

/// Coordination client backed by a ZooKeeper ensemble
pub struct ZkConnection {
    zk: Arc<ZooKeeper>,
    base_path: String,
    listeners: Arc<StateListeners>,
}

fn stat_of(stat: &Stat) -> NodeStat {
    NodeStat {
        version: stat.version,
        cversion: stat.cversion,
        ephemeral_owner: stat.ephemeral_owner,
    }
}

fn watch_event_of(event: &WatchedEvent) -> WatchEvent {
    match event.event_type {
        WatchedEventType::NodeCreated => WatchEvent::NodeCreated,
        WatchedEventType::NodeDeleted => WatchEvent::NodeDeleted,
        WatchedEventType::NodeDataChanged => WatchEvent::NodeDataChanged,
        WatchedEventType::NodeChildrenChanged => WatchEvent::NodeChildrenChanged,
        WatchedEventType::None => match event.keeper_state {
            KeeperState::SyncConnected | KeeperState::ConnectedReadOnly => WatchEvent::NotWatching,
            _ => WatchEvent::Disconnected,
        },
        _ => WatchEvent::NotWatching,
    }
}

/// Watch closure that forwards the first event it sees and drops the rest
fn watch_forwarder() -> (impl Fn(WatchedEvent) + Send + 'static, EventReceiver) {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let forward = move |event: WatchedEvent| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(watch_event_of(&event));
        }
    };
    (forward, rx)
}

/// Parse `scheme:owner`
fn parse_auth(auth: &str) -> UiUpdateResult<(String, Vec<u8>)> {
    match auth.split_once(':') {
        Some((scheme, owner)) if !scheme.is_empty() && !owner.is_empty() => {
            Ok((scheme.to_string(), owner.as_bytes().to_vec()))
        }
        _ => Err(UiUpdateError::ConfigurationError {
            component: "zookeeper".to_string(),
            message: "auth must have the form 'scheme:owner'".to_string(),
        }),
    }
}

impl ZkConnection {
    /// Connect, wait for the first session, authenticate and create the base path
    pub async fn connect(options: ConnectOptions) -> UiUpdateResult<Arc<Self>> {
        let base_path = normalize_base_path(&options.base_path)?;
        let auth = options.auth.as_deref().map(parse_auth).transpose()?;

        let listeners = Arc::new(StateListeners::new(ClientState::Disconnected));
        let (init_tx, init_rx) = oneshot::channel();
        let watcher = SessionWatcher {
            listeners: listeners.clone(),
            initialized: Mutex::new(Some(init_tx)),
        };

        info!(address = %options.address, base_path = %base_path, "connecting to coordination service");
        let address = options.address.clone();
        let session_timeout = options.session_timeout;
        let zk = tokio::task::spawn_blocking(move || {
            ZooKeeper::connect(&address, session_timeout, watcher)
        })
        .await?
        .map_err(|e| UiUpdateError::coordination("connect", "/", e.into()))?;
        let zk = Arc::new(zk);

        if tokio::time::timeout(options.connect_timeout, init_rx)
            .await
            .is_err()
        {
            let _ = zk.close();
            return Err(UiUpdateError::Timeout {
                operation: format!("connecting to {}", options.address),
                duration: options.connect_timeout,
            });
        }

        if let Some((scheme, owner)) = auth {
            let zk = zk.clone();
            tokio::task::spawn_blocking(move || zk.add_auth(scheme, owner))
                .await?
                .map_err(|e| UiUpdateError::coordination("add_auth", "/", e.into()))?;
        }

        let connection = Arc::new(Self {
            zk,
            base_path,
            listeners,
        });
        ensure_path(connection.as_ref(), &connection.base_path).await?;
        info!(base_path = %connection.base_path, "coordination session established");
        Ok(connection)
    }

    /// Run a blocking request against the session
    async fn call<T, F>(&self, operation: &'static str, path: &str, request: F) -> UiUpdateResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ZooKeeper, &str) -> Result<T, ZkError> + Send + 'static,
    {
        let zk = self.zk.clone();
        let owned_path = path.to_string();
        tokio::task::spawn_blocking(move || request(&zk, &owned_path))
            .await?
            .map_err(|e| UiUpdateError::coordination(operation, path, e.into()))
    }
}

#[async_trait]
impl ZkClient for ZkConnection {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    fn client_state(&self) -> ClientState {
        self.listeners.state()
    }

    fn register_listener(&self, id: &str, listener: mpsc::UnboundedSender<ClientState>) {
        self.listeners.register(id, listener);
    }

    fn unregister_listener(&self, id: &str) {
        self.listeners.unregister(id);
    }

    async fn exists(&self, path: &str) -> UiUpdateResult<Option<NodeStat>> {
        self.call("exists", path, |zk, path| zk.exists(path, false))
            .await
            .map(|stat| stat.as_ref().map(stat_of))
    }

    async fn exists_watch(&self, path: &str) -> UiUpdateResult<(Option<NodeStat>, EventReceiver)> {
        let (forward, events) = watch_forwarder();
        let stat = self
            .call("exists", path, move |zk, path| zk.exists_w(path, forward))
            .await?;
        Ok((stat.as_ref().map(stat_of), events))
    }

    async fn get(&self, path: &str) -> UiUpdateResult<(Vec<u8>, NodeStat)> {
        let (data, stat) = self
            .call("get", path, |zk, path| zk.get_data(path, false))
            .await?;
        Ok((data, stat_of(&stat)))
    }

    async fn get_watch(&self, path: &str) -> UiUpdateResult<(Vec<u8>, NodeStat, EventReceiver)> {
        let (forward, events) = watch_forwarder();
        let (data, stat) = self
            .call("get", path, move |zk, path| zk.get_data_w(path, forward))
            .await?;
        Ok((data, stat_of(&stat), events))
    }

    async fn children(&self, path: &str) -> UiUpdateResult<(Vec<String>, NodeStat)> {
        let (children, stat) = self
            .call("children", path, |zk, path| {
                let children = zk.get_children(path, false)?;
                let stat = zk.exists(path, false)?.ok_or(ZkError::NoNode)?;
                Ok((children, stat))
            })
            .await?;
        Ok((children, stat_of(&stat)))
    }

    async fn children_watch(
        &self,
        path: &str,
    ) -> UiUpdateResult<(Vec<String>, NodeStat, EventReceiver)> {
        let (forward, events) = watch_forwarder();
        let (children, stat) = self
            .call("children", path, move |zk, path| {
                let children = zk.get_children_w(path, forward)?;
                let stat = zk.exists(path, false)?.ok_or(ZkError::NoNode)?;
                Ok((children, stat))
            })
            .await?;
        Ok((children, stat_of(&stat), events))
    }

    async fn create(
        &self,
        path: &str,
        value: &[u8],
        permissions: Permissions,
        kind: NodeKind,
    ) -> UiUpdateResult<()> {
        let value = value.to_vec();
        let acl = match permissions {
            Permissions::All => Acl::open_unsafe().clone(),
            Permissions::CreatorAll => Acl::creator_all().clone(),
        };
        let mode = match kind {
            NodeKind::Persistent => CreateMode::Persistent,
            NodeKind::Ephemeral => CreateMode::Ephemeral,
        };
        self.call("create", path, move |zk, path| {
            zk.create(path, value, acl, mode).map(|_| ())
        })
        .await
    }

    async fn set_versioned(
        &self,
        path: &str,
        value: &[u8],
        version: i32,
    ) -> UiUpdateResult<NodeStat> {
        let value = value.to_vec();
        let stat = self
            .call("set", path, move |zk, path| {
                zk.set_data(path, value, Some(version))
            })
            .await?;
        Ok(stat_of(&stat))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> UiUpdateResult<()> {
        self.call("delete", path, move |zk, path| zk.delete(path, version))
            .await
    }

    async fn close(&self) {
        let zk = self.zk.clone();
        match tokio::task::spawn_blocking(move || zk.close()).await {
            Ok(Ok(())) => debug!("coordination session closed"),
            Ok(Err(e)) => warn!(error = ?e, "failed to close coordination session"),
            Err(e) => warn!(error = %e, "close task failed"),
        }
        self.listeners.transition(ClientState::Disconnected);
    }
}

impl std::fmt::Debug for ZkConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkConnection")
            .field("base_path", &self.base_path)
            .field("state", &self.listeners.state())
            .finish()
    }
}
