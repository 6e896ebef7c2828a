//! Cluster-wide current UI version
//!
//! The `<base>/version` znode is the source of truth for which UI every
//! master should serve. [`ZkVersionStore`] keeps a local copy of it, kept
//! live by a value watcher, and broadcasts every observed write to local
//! subscribers.
//!
//! Initialization runs in the background: once the client is connected the
//! node is created with the pre-bundled (empty) version if it is missing,
//! otherwise read. Failing to create or read it for any reason other than a
//! lost connection is fatal and reported through [`ZkVersionStore::ready`].

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::retry::{BackoffConfig, ExponentialBackoff};
use crate::types::UiVersion;
use crate::watcher::{NodeValue, NodeWatcher, WatchUpdate};
use crate::zk::{ClientState, NodeKind, Permissions, ZkClient, ZnodeLayout};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const LISTENER_ID: &str = "version-store";

/// Progress of the background initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    Pending,
    Ready,
    Failed(String),
}

/// Local cache of the cluster's current UI version
pub struct ZkVersionStore {
    client: Arc<dyn ZkClient>,
    path: String,
    poll_interval: Duration,
    current: RwLock<Option<UiVersion>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<UiVersion>>>,
    init: watch::Sender<InitState>,
    watcher: Mutex<Option<NodeWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ZkVersionStore {
    /// Create the store and start initializing it in the background
    pub fn start(
        client: Arc<dyn ZkClient>,
        layout: &ZnodeLayout,
        poll_interval: Duration,
        connect_backoff: BackoffConfig,
    ) -> Arc<Self> {
        let (init, _) = watch::channel(InitState::Pending);
        let store = Arc::new(Self {
            client,
            path: layout.version(),
            poll_interval,
            current: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            init,
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(store.clone().initialize(connect_backoff));
        store.tasks.lock().push(task);
        store
    }

    /// Wait for initialization and return the version it found
    pub async fn ready(&self) -> UiUpdateResult<UiVersion> {
        let mut init = self.init.subscribe();
        let state = init
            .wait_for(|state| *state != InitState::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| UiUpdateError::Internal {
                message: "version store stopped before initializing".to_string(),
            })?;
        match state {
            InitState::Failed(message) => Err(UiUpdateError::Internal { message }),
            _ => self.current_version(),
        }
    }

    pub fn init_state(&self) -> InitState {
        self.init.borrow().clone()
    }

    /// Last known cluster version
    ///
    /// Fails with `ZookeeperNotConnected` until the store is initialized.
    pub fn current_version(&self) -> UiUpdateResult<UiVersion> {
        self.current
            .read()
            .clone()
            .ok_or(UiUpdateError::ZookeeperNotConnected)
    }

    /// Write a new cluster version
    pub async fn update_current_version(&self, version: &UiVersion) -> UiUpdateResult<()> {
        if self.client.client_state() != ClientState::Connected {
            return Err(UiUpdateError::ZookeeperNotConnected);
        }
        let value = version.as_str().as_bytes();
        match self.client.set(&self.path, value).await {
            Ok(_) => {}
            Err(e) if e.is_no_node() => {
                self.client
                    .create(&self.path, value, Permissions::All, NodeKind::Persistent)
                    .await?
            }
            Err(e) => return Err(e),
        }
        info!(version = %version, "updated cluster version");
        *self.current.write() = Some(version.clone());
        Ok(())
    }

    /// Subscribe to version changes
    ///
    /// The receiver gets the current version first (immediately if the store
    /// is initialized, otherwise once it is) and then every observed write.
    pub fn watch_for_version_change(&self) -> mpsc::UnboundedReceiver<UiVersion> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        if let Some(current) = self.current.read().clone() {
            let _ = tx.send(current);
        }
        listeners.push(tx);
        rx
    }

    /// Stop the watcher and background tasks
    pub fn close(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.close();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.client.unregister_listener(LISTENER_ID);
    }

    /// Cache `version` and hand it to every subscriber
    fn publish(&self, version: &UiVersion) {
        let mut listeners = self.listeners.lock();
        *self.current.write() = Some(version.clone());
        listeners.retain(|listener| listener.send(version.clone()).is_ok());
        debug!(version = %version, subscribers = listeners.len(), "broadcast cluster version");
    }

    async fn initialize(self: Arc<Self>, connect_backoff: BackoffConfig) {
        let mut backoff = ExponentialBackoff::new(connect_backoff);
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        self.client.register_listener(LISTENER_ID, state_tx);

        loop {
            if self.client.client_state() != ClientState::Connected {
                match state_rx.recv().await {
                    Some(_) => continue,
                    None => break,
                }
            }

            match self.load().await {
                Ok(version) => {
                    info!(version = %version, "version store initialized");
                    self.init.send_replace(InitState::Ready);
                    break;
                }
                Err(e) if e.is_connection_error() => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay = ?delay, "version store not initialized, retrying");
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(path = %self.path, error = %e, "cannot read or create the version node");
                    self.init.send_replace(InitState::Failed(e.to_string()));
                    break;
                }
            }
        }

        self.client.unregister_listener(LISTENER_ID);
    }

    /// Make sure the version node exists and start watching it
    async fn load(self: &Arc<Self>) -> UiUpdateResult<UiVersion> {
        if self.client.exists(&self.path).await?.is_none() {
            match self
                .client
                .create(&self.path, &[], Permissions::All, NodeKind::Persistent)
                .await
            {
                Ok(()) => info!(path = %self.path, "created version node with pre-bundled version"),
                Err(e) if e.is_node_exists() => {}
                Err(e) => return Err(e),
            }
        } else {
            self.client.get(&self.path).await?;
        }

        let (tx, rx) = mpsc::channel(16);
        let watcher =
            NodeWatcher::create(self.client.clone(), &self.path, self.poll_interval, tx).await?;
        let version = match UiVersion::from_bytes(&watcher.data()) {
            Ok(version) => version,
            Err(e) => {
                watcher.close();
                return Err(e);
            }
        };
        *self.watcher.lock() = Some(watcher);
        self.publish(&version);

        let task = tokio::spawn(self.clone().follow(rx));
        self.tasks.lock().push(task);
        Ok(version)
    }

    async fn follow(self: Arc<Self>, mut updates: mpsc::Receiver<WatchUpdate<NodeValue>>) {
        while let Some(update) = updates.recv().await {
            let version = match UiVersion::from_bytes(&update.value.data) {
                Ok(version) => version,
                Err(e) => {
                    warn!(path = %self.path, error = %e, "ignoring unusable cluster version");
                    continue;
                }
            };
            debug!(version = %version, node_version = ?update.value.version, "version node changed");
            self.publish(&version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zk::MemoryEnsemble;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn quick_backoff() -> BackoffConfig {
        BackoffConfig {
            min: Duration::from_millis(10),
            max: Duration::from_millis(50),
            factor: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_creates_missing_version_node() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let store = ZkVersionStore::start(
            client,
            &ZnodeLayout::new("/base"),
            Duration::from_secs(60),
            quick_backoff(),
        );

        let version = timeout(WAIT, store.ready()).await.unwrap().unwrap();
        assert!(version.is_prebundled());
        assert_eq!(ensemble.value("/base/version").unwrap(), Vec::<u8>::new());
        assert_eq!(store.init_state(), InitState::Ready);
    }

    #[tokio::test]
    async fn test_not_connected_before_init() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        client.disconnect();
        let store = ZkVersionStore::start(
            client.clone(),
            &ZnodeLayout::new("/base"),
            Duration::from_secs(60),
            quick_backoff(),
        );
        assert!(matches!(
            store.current_version(),
            Err(UiUpdateError::ZookeeperNotConnected)
        ));
        assert!(matches!(
            store.update_current_version(&UiVersion::new("1.0")).await,
            Err(UiUpdateError::ZookeeperNotConnected)
        ));

        client.reconnect();
        timeout(WAIT, store.ready()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_see_current_then_changes() {
        let ensemble = MemoryEnsemble::new();
        ensemble.put("/base", b"").unwrap();
        ensemble.put("/base/version", b"2.24.4").unwrap();
        let client = ensemble.connect("/base").await.unwrap();
        let store = ZkVersionStore::start(
            client.clone(),
            &ZnodeLayout::new("/base"),
            Duration::from_secs(60),
            quick_backoff(),
        );
        assert_eq!(
            timeout(WAIT, store.ready()).await.unwrap().unwrap(),
            UiVersion::new("2.24.4")
        );

        let mut changes = store.watch_for_version_change();
        assert_eq!(changes.recv().await.unwrap(), UiVersion::new("2.24.4"));

        let other = ensemble.connect("/base").await.unwrap();
        other.set("/base/version", b"2.25.0").await.unwrap();
        let next = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(next, UiVersion::new("2.25.0"));
        assert_eq!(store.current_version().unwrap(), UiVersion::new("2.25.0"));

        // Rewriting the same value is still broadcast.
        other.set("/base/version", b"2.25.0").await.unwrap();
        let again = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(again, UiVersion::new("2.25.0"));
    }

    #[tokio::test]
    async fn test_update_current_version() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let store = ZkVersionStore::start(
            client,
            &ZnodeLayout::new("/base"),
            Duration::from_secs(60),
            quick_backoff(),
        );
        timeout(WAIT, store.ready()).await.unwrap().unwrap();

        store
            .update_current_version(&UiVersion::new("3.0.0"))
            .await
            .unwrap();
        assert_eq!(store.current_version().unwrap(), UiVersion::new("3.0.0"));
        assert_eq!(ensemble.value_string("/base/version").unwrap(), "3.0.0");
    }

    #[tokio::test]
    async fn test_path_like_version_is_not_broadcast() {
        let ensemble = MemoryEnsemble::new();
        ensemble.put("/base", b"").unwrap();
        ensemble.put("/base/version", b"2.24.4").unwrap();
        let client = ensemble.connect("/base").await.unwrap();
        let store = ZkVersionStore::start(
            client,
            &ZnodeLayout::new("/base"),
            Duration::from_secs(60),
            quick_backoff(),
        );
        timeout(WAIT, store.ready()).await.unwrap().unwrap();
        let mut changes = store.watch_for_version_change();
        assert_eq!(changes.recv().await.unwrap(), UiVersion::new("2.24.4"));

        let other = ensemble.connect("/base").await.unwrap();
        other.set("/base/version", b"..").await.unwrap();
        other.set("/base/version", b"2.25.0").await.unwrap();

        let next = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(next, UiVersion::new("2.25.0"));
        assert_eq!(store.current_version().unwrap(), UiVersion::new("2.25.0"));
    }
}
