//! In-process coordination service
//!
//! [`MemoryEnsemble`] keeps a znode tree with data and children versions,
//! ephemeral ownership and one-shot watches. Each [`MemoryClient`] is a
//! session against that tree and implements [`ZkClient`], so several agents
//! in one process can coordinate exactly as they would through ZooKeeper.
//! Sessions can be disconnected, expired and reconnected to exercise the
//! failure paths.

use super::{
    ensure_path, normalize_base_path, ClientState, EventReceiver, NodeKind, NodeStat, Permissions,
    StateListeners, WatchEvent, ZkClient,
};
use crate::error::{UiUpdateError, UiUpdateResult, ZkErrorCode};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// A znode tree shared by every [`MemoryClient`] connected to it
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

struct Znode {
    data: Vec<u8>,
    version: i32,
    cversion: i32,
    ephemeral_owner: i64,
}

impl Znode {
    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            cversion: self.cversion,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

struct Watch {
    session: i64,
    tx: oneshot::Sender<WatchEvent>,
}

struct Tree {
    nodes: BTreeMap<String, Znode>,
    data_watches: HashMap<String, Vec<Watch>>,
    child_watches: HashMap<String, Vec<Watch>>,
    next_session: i64,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Znode {
                data: Vec::new(),
                version: 0,
                cversion: 0,
                ephemeral_owner: 0,
            },
        );
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 1,
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn zk_err(operation: &str, path: &str, code: ZkErrorCode) -> UiUpdateError {
    UiUpdateError::coordination(operation, path, code)
}

impl Tree {
    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(watches: &mut HashMap<String, Vec<Watch>>, path: &str, event: WatchEvent) {
        if let Some(pending) = watches.remove(path) {
            for watch in pending {
                let _ = watch.tx.send(event);
            }
        }
    }

    fn create(
        &mut self,
        path: &str,
        value: &[u8],
        kind: NodeKind,
        session: i64,
    ) -> UiUpdateResult<()> {
        if self.nodes.contains_key(path) {
            return Err(zk_err("create", path, ZkErrorCode::NodeExists));
        }
        let parent = parent_of(path).to_string();
        match self.nodes.get_mut(&parent) {
            Some(parent_node) if parent_node.ephemeral_owner != 0 => {
                return Err(zk_err(
                    "create",
                    path,
                    ZkErrorCode::Other("ephemeral nodes cannot have children".to_string()),
                ));
            }
            Some(parent_node) => parent_node.cversion += 1,
            None => return Err(zk_err("create", path, ZkErrorCode::NoNode)),
        }
        let ephemeral_owner = match kind {
            NodeKind::Persistent => 0,
            NodeKind::Ephemeral => session,
        };
        self.nodes.insert(
            path.to_string(),
            Znode {
                data: value.to_vec(),
                version: 0,
                cversion: 0,
                ephemeral_owner,
            },
        );
        Self::fire(&mut self.data_watches, path, WatchEvent::NodeCreated);
        Self::fire(&mut self.child_watches, &parent, WatchEvent::NodeChildrenChanged);
        Ok(())
    }

    fn set(&mut self, path: &str, value: &[u8], version: i32) -> UiUpdateResult<NodeStat> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| zk_err("set", path, ZkErrorCode::NoNode))?;
        if version >= 0 && node.version != version {
            return Err(zk_err("set", path, ZkErrorCode::BadVersion));
        }
        node.data = value.to_vec();
        node.version += 1;
        let stat = node.stat();
        Self::fire(&mut self.data_watches, path, WatchEvent::NodeDataChanged);
        Ok(stat)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> UiUpdateResult<()> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| zk_err("delete", path, ZkErrorCode::NoNode))?;
        if let Some(expected) = version {
            if expected >= 0 && node.version != expected {
                return Err(zk_err("delete", path, ZkErrorCode::BadVersion));
            }
        }
        if !self.children_of(path).is_empty() {
            return Err(zk_err("delete", path, ZkErrorCode::NotEmpty));
        }
        self.nodes.remove(path);
        let parent = parent_of(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.cversion += 1;
        }
        Self::fire(&mut self.data_watches, path, WatchEvent::NodeDeleted);
        Self::fire(&mut self.child_watches, path, WatchEvent::NodeDeleted);
        Self::fire(&mut self.child_watches, &parent, WatchEvent::NodeChildrenChanged);
        Ok(())
    }

    /// Notify and drop every pending watch of `session`
    fn drop_session_watches(&mut self, session: i64) {
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for pending in watches.values_mut() {
                let (dropped, kept): (Vec<_>, Vec<_>) =
                    pending.drain(..).partition(|watch| watch.session == session);
                *pending = kept;
                for watch in dropped {
                    let _ = watch.tx.send(WatchEvent::Disconnected);
                }
            }
            watches.retain(|_, pending| !pending.is_empty());
        }
    }

    fn remove_ephemerals(&mut self, session: i64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            debug!(path = %path, session, "removing ephemeral node of expired session");
            let _ = self.delete(&path, None);
        }
    }

    fn watch(
        watches: &mut HashMap<String, Vec<Watch>>,
        path: &str,
        session: i64,
    ) -> EventReceiver {
        let (tx, rx) = oneshot::channel();
        watches
            .entry(path.to_string())
            .or_default()
            .push(Watch { session, tx });
        rx
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session whose base path is created on connect
    pub async fn connect(&self, base_path: &str) -> UiUpdateResult<Arc<MemoryClient>> {
        let base_path = normalize_base_path(base_path)?;
        let session = self.open_session();
        let client = Arc::new(MemoryClient {
            ensemble: self.clone(),
            base_path,
            session: Mutex::new(session),
            listeners: StateListeners::new(ClientState::Connected),
        });
        ensure_path(client.as_ref(), &client.base_path).await?;
        Ok(client)
    }

    fn open_session(&self) -> i64 {
        let mut tree = self.tree.lock();
        let session = tree.next_session;
        tree.next_session += 1;
        session
    }

    /// Data of `path`, if it exists
    pub fn value(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Data of `path` as a string, if it exists
    pub fn value_string(&self, path: &str) -> Option<String> {
        self.value(path)
            .map(|data| String::from_utf8_lossy(&data).into_owned())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Names of the direct children of `path`
    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree.lock().children_of(path)
    }

    /// Write `path` outside of any session, creating it if needed
    pub fn put(&self, path: &str, value: &[u8]) -> UiUpdateResult<()> {
        let mut tree = self.tree.lock();
        if tree.nodes.contains_key(path) {
            tree.set(path, value, -1).map(|_| ())
        } else {
            tree.create(path, value, NodeKind::Persistent, 0)
        }
    }
}

/// One session against a [`MemoryEnsemble`]
pub struct MemoryClient {
    ensemble: MemoryEnsemble,
    base_path: String,
    session: Mutex<i64>,
    listeners: StateListeners,
}

impl MemoryClient {
    pub fn session_id(&self) -> i64 {
        *self.session.lock()
    }

    /// Number of registered state listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Drop the connection; the session and its ephemeral nodes survive
    pub fn disconnect(&self) {
        let session = self.session_id();
        self.listeners.transition(ClientState::Disconnected);
        self.ensemble.tree.lock().drop_session_watches(session);
    }

    /// Drop the connection and let the service expire the session
    pub fn expire_session(&self) {
        self.disconnect();
        let mut session = self.session.lock();
        if *session != 0 {
            self.ensemble.tree.lock().remove_ephemerals(*session);
            *session = 0;
        }
    }

    /// Re-establish the connection, opening a fresh session if the old one expired
    pub fn reconnect(&self) {
        {
            let mut session = self.session.lock();
            if *session == 0 {
                *session = self.ensemble.open_session();
            }
        }
        self.listeners.transition(ClientState::Connected);
    }

    fn live_session(&self, operation: &str, path: &str) -> UiUpdateResult<i64> {
        if self.listeners.state() != ClientState::Connected {
            return Err(zk_err(operation, path, ZkErrorCode::ConnectionLoss));
        }
        Ok(self.session_id())
    }
}

#[async_trait]
impl ZkClient for MemoryClient {
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
        self.live_session("exists", path)?;
        Ok(self.ensemble.tree.lock().nodes.get(path).map(Znode::stat))
    }

    async fn exists_watch(&self, path: &str) -> UiUpdateResult<(Option<NodeStat>, EventReceiver)> {
        let session = self.live_session("exists", path)?;
        let mut tree = self.ensemble.tree.lock();
        let stat = tree.nodes.get(path).map(Znode::stat);
        let events = Tree::watch(&mut tree.data_watches, path, session);
        Ok((stat, events))
    }

    async fn get(&self, path: &str) -> UiUpdateResult<(Vec<u8>, NodeStat)> {
        self.live_session("get", path)?;
        let tree = self.ensemble.tree.lock();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| zk_err("get", path, ZkErrorCode::NoNode))?;
        Ok((node.data.clone(), node.stat()))
    }

    async fn get_watch(&self, path: &str) -> UiUpdateResult<(Vec<u8>, NodeStat, EventReceiver)> {
        let session = self.live_session("get", path)?;
        let mut tree = self.ensemble.tree.lock();
        let (data, stat) = {
            let node = tree
                .nodes
                .get(path)
                .ok_or_else(|| zk_err("get", path, ZkErrorCode::NoNode))?;
            (node.data.clone(), node.stat())
        };
        let events = Tree::watch(&mut tree.data_watches, path, session);
        Ok((data, stat, events))
    }

    async fn children(&self, path: &str) -> UiUpdateResult<(Vec<String>, NodeStat)> {
        self.live_session("children", path)?;
        let tree = self.ensemble.tree.lock();
        let stat = tree
            .nodes
            .get(path)
            .map(Znode::stat)
            .ok_or_else(|| zk_err("children", path, ZkErrorCode::NoNode))?;
        Ok((tree.children_of(path), stat))
    }

    async fn children_watch(
        &self,
        path: &str,
    ) -> UiUpdateResult<(Vec<String>, NodeStat, EventReceiver)> {
        let session = self.live_session("children", path)?;
        let mut tree = self.ensemble.tree.lock();
        let stat = tree
            .nodes
            .get(path)
            .map(Znode::stat)
            .ok_or_else(|| zk_err("children", path, ZkErrorCode::NoNode))?;
        let children = tree.children_of(path);
        let events = Tree::watch(&mut tree.child_watches, path, session);
        Ok((children, stat, events))
    }

    async fn create(
        &self,
        path: &str,
        value: &[u8],
        _permissions: Permissions,
        kind: NodeKind,
    ) -> UiUpdateResult<()> {
        let session = self.live_session("create", path)?;
        self.ensemble.tree.lock().create(path, value, kind, session)
    }

    async fn set_versioned(
        &self,
        path: &str,
        value: &[u8],
        version: i32,
    ) -> UiUpdateResult<NodeStat> {
        self.live_session("set", path)?;
        self.ensemble.tree.lock().set(path, value, version)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> UiUpdateResult<()> {
        self.live_session("delete", path)?;
        self.ensemble.tree.lock().delete(path, version)
    }

    async fn close(&self) {
        self.expire_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_base_path() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/dcos/ui-update/").await.unwrap();
        assert_eq!(client.base_path(), "/dcos/ui-update");
        assert!(ensemble.exists("/dcos"));
        assert!(ensemble.exists("/dcos/ui-update"));
    }

    #[tokio::test]
    async fn test_create_get_and_cas() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();

        client
            .create("/base/v", b"1", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap();
        let err = client
            .create("/base/v", b"1", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_node_exists());

        let (data, stat) = client.get("/base/v").await.unwrap();
        assert_eq!(data, b"1");
        assert_eq!(stat.version, 0);

        client.set_versioned("/base/v", b"2", 0).await.unwrap();
        let err = client.set_versioned("/base/v", b"3", 0).await.unwrap_err();
        assert!(err.is_bad_version());

        let stat = client.set("/base/v", b"3").await.unwrap();
        assert_eq!(stat.version, 2);
        assert_eq!(ensemble.value_string("/base/v").unwrap(), "3");
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let err = client
            .create("/base/a/b", b"", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn test_watches_fire_once() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();

        let (stat, created) = client.exists_watch("/base/x").await.unwrap();
        assert!(stat.is_none());
        client
            .create("/base/x", b"a", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap();
        assert_eq!(created.await.unwrap(), WatchEvent::NodeCreated);

        let (_, _, changed) = client.get_watch("/base/x").await.unwrap();
        let (_, _, children) = client.children_watch("/base").await.unwrap();
        client.set("/base/x", b"b").await.unwrap();
        assert_eq!(changed.await.unwrap(), WatchEvent::NodeDataChanged);

        client.delete("/base/x", None).await.unwrap();
        assert_eq!(children.await.unwrap(), WatchEvent::NodeChildrenChanged);
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        ensure_path(client.as_ref(), "/base/a/deep").await.unwrap();
        client
            .create("/base/b", b"", Permissions::All, NodeKind::Persistent)
            .await
            .unwrap();
        let (children, stat) = client.children("/base").await.unwrap();
        assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stat.cversion, 2);
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect("/base").await.unwrap();
        let observer = ensemble.connect("/base").await.unwrap();

        owner
            .create("/base/e", b"x", Permissions::All, NodeKind::Ephemeral)
            .await
            .unwrap();
        let (_, deleted) = observer.exists_watch("/base/e").await.unwrap();

        owner.disconnect();
        assert!(ensemble.exists("/base/e"));
        assert!(owner.exists("/base/e").await.unwrap_err().is_connection_error());

        owner.expire_session();
        assert!(!ensemble.exists("/base/e"));
        assert_eq!(deleted.await.unwrap(), WatchEvent::NodeDeleted);

        let old_session = owner.session_id();
        owner.reconnect();
        assert_ne!(owner.session_id(), old_session);
        assert_eq!(owner.client_state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_pending_watches() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect("/base").await.unwrap();
        let (_, events) = client.exists_watch("/base/x").await.unwrap();
        client.disconnect();
        assert_eq!(events.await.unwrap(), WatchEvent::Disconnected);
    }
}
