//! Operation follower
//!
//! Every master runs one [`OperationFollower`] for its whole lifetime. It
//! watches `cluster-status`, joins an operation when it is requested by
//! creating its ephemeral `node-status/<node id>`, moves that status along
//! the per-node table in [`next_node_state`] and runs the local side effect
//! while the cluster is in progress.
//!
//! Participation ends when the cluster status no longer names the operation
//! (normally when the leader writes the `Idle` sentinel back); the per-node
//! znode is then deleted.

use super::status::{Operation, OperationState, OperationStatus};
use super::{put_value, OperationConfig};
use crate::error::{UiUpdateError, UiUpdateResult};
use crate::retry::{retry, BackoffConfig, ExponentialBackoff};
use crate::types::UiVersion;
use crate::watcher::{NodeValue, NodeWatcher, WatchUpdate};
use crate::zk::{ensure_path, ClientState, NodeKind, Permissions, ZkClient, ZnodeLayout};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Local side of an operation, provided by the service
#[async_trait]
pub trait LocalOperations: Send + Sync + 'static {
    /// This master joined `status`
    async fn operation_started(&self, status: &OperationStatus);

    /// Serve the pre-bundled UI and drop every downloaded version
    async fn perform_reset(&self) -> UiUpdateResult<()>;

    /// Download, unpack and serve `version`
    async fn perform_update(&self, version: &UiVersion) -> UiUpdateResult<()>;

    /// This master left `status`; `completed` tells whether the cluster reached Complete
    async fn operation_finished(&self, status: &OperationStatus, completed: bool);
}

/// Side effect requested by a per-node transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerEffect {
    None,
    BeginPerform,
    Cleanup,
}

/// Next per-node state given the observed cluster state
pub fn next_node_state(
    current: OperationState,
    cluster: OperationState,
) -> (OperationState, FollowerEffect) {
    use OperationState::*;

    match (current, cluster) {
        (Requested, InProgress) => (InProgress, FollowerEffect::BeginPerform),
        (Requested, Requested) => (Requested, FollowerEffect::None),
        (Requested, Failed) => (Failed, FollowerEffect::None),
        (Requested, Idle) => (Idle, FollowerEffect::Cleanup),
        (Requested, _) => (Failed, FollowerEffect::None),
        (InProgress, _) => (InProgress, FollowerEffect::None),
        (Complete, Complete) => (Idle, FollowerEffect::Cleanup),
        (Complete, _) => (Complete, FollowerEffect::None),
        (Failed, Idle | Failed | Complete) => (Idle, FollowerEffect::Cleanup),
        (Failed, _) => (Failed, FollowerEffect::None),
        (state, _) => (state, FollowerEffect::None),
    }
}

/// Handle of the follower task
pub struct OperationFollower {
    closed: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl OperationFollower {
    pub fn start(
        client: Arc<dyn ZkClient>,
        layout: ZnodeLayout,
        node_id: impl Into<String>,
        config: OperationConfig,
        local: Arc<dyn LocalOperations>,
    ) -> Self {
        let node_id = node_id.into();
        let (closed, closed_rx) = watch::channel(false);
        let (perform_tx, perform_rx) = mpsc::channel(4);
        let follower = FollowerLoop {
            node_path: layout.node_status(&node_id),
            client,
            layout,
            node_id,
            config,
            local,
            participation: None,
            perform_tx,
        };
        let task = tokio::spawn(follower.run(closed_rx, perform_rx));
        Self {
            closed,
            task: Some(task),
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Close and wait for the task to exit
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for OperationFollower {
    fn drop(&mut self) {
        self.close();
    }
}

struct Participation {
    /// This node's own status
    status: OperationStatus,
    performing: bool,
    /// The cluster reached Complete for this operation
    completed: bool,
}

type Performed = (OperationStatus, UiUpdateResult<()>);

struct FollowerLoop {
    client: Arc<dyn ZkClient>,
    layout: ZnodeLayout,
    node_id: String,
    node_path: String,
    config: OperationConfig,
    local: Arc<dyn LocalOperations>,
    participation: Option<Participation>,
    perform_tx: mpsc::Sender<Performed>,
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

impl FollowerLoop {
    async fn run(
        mut self,
        mut closed: watch::Receiver<bool>,
        mut performed: mpsc::Receiver<Performed>,
    ) {
        let (tx, mut updates) = mpsc::channel(16);
        let Some(watcher) = self.open_watcher(tx, &mut closed).await else {
            return;
        };

        let listener_id = format!("follower:{}", self.node_id);
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();
        self.client.register_listener(&listener_id, state_tx);
        let mut connected = true;

        info!(node_id = %self.node_id, "following cluster operations");
        self.on_cluster_status(current_status(&watcher)).await;

        loop {
            tokio::select! {
                _ = wait_closed(&mut closed) => break,
                Some(update) = updates.recv() => {
                    self.on_cluster_status(status_of(&update)).await;
                }
                Some((status, result)) = performed.recv() => {
                    self.on_performed(status, result).await;
                    self.on_cluster_status(current_status(&watcher)).await;
                }
                state = state_rx.recv() => match state {
                    Some(ClientState::Connected) => {
                        if !connected {
                            connected = true;
                            self.restore_node().await;
                            self.on_cluster_status(current_status(&watcher)).await;
                        }
                    }
                    Some(ClientState::Disconnected) => connected = false,
                    None => break,
                },
            }
        }

        watcher.close();
        self.client.unregister_listener(&listener_id);
        debug!(node_id = %self.node_id, "follower stopped");
    }

    /// Watch the cluster status, retrying until the client lets us
    async fn open_watcher(
        &self,
        tx: mpsc::Sender<WatchUpdate<NodeValue>>,
        closed: &mut watch::Receiver<bool>,
    ) -> Option<NodeWatcher> {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::watcher());
        loop {
            match NodeWatcher::create(
                self.client.clone(),
                &self.layout.cluster_status(),
                self.config.poll_interval,
                tx.clone(),
            )
            .await
            {
                Ok(watcher) => return Some(watcher),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay = ?delay, "cannot watch cluster status yet");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wait_closed(closed) => return None,
                    }
                }
            }
        }
    }

    async fn on_cluster_status(&mut self, cluster: OperationStatus) {
        if self.participation.is_none() {
            if joinable(&cluster) {
                self.join(cluster).await;
            }
            return;
        }
        let Some(participation) = self.participation.as_mut() else {
            return;
        };
        if participation.status.same_operation(&cluster)
            && cluster.state == OperationState::Complete
        {
            participation.completed = true;
        }
        let own = participation.status.clone();
        let performing = participation.performing;

        if !own.same_operation(&cluster) {
            if performing {
                debug!(cluster = %cluster, "operation ended while performing, leaving afterwards");
                return;
            }
            self.leave().await;
            if joinable(&cluster) {
                self.join(cluster).await;
            }
            return;
        }

        if performing {
            return;
        }

        let (next, effect) = next_node_state(own.state, cluster.state);
        if next != own.state && !self.write_state(next).await {
            return;
        }
        match effect {
            FollowerEffect::BeginPerform => self.begin_perform(),
            FollowerEffect::Cleanup => debug!(status = %own, "node cleaned up"),
            FollowerEffect::None => {}
        }
    }

    async fn join(&mut self, cluster: OperationStatus) {
        let client = self.client.as_ref();
        let path = self.node_path.as_str();
        let value = cluster.to_bytes();
        let value = value.as_slice();
        let root = self.layout.node_status_root();
        let root = root.as_str();
        let config = self.config.init_retry("create node status");

        let created = retry(&config, || async move {
            match client
                .create(path, value, Permissions::All, NodeKind::Ephemeral)
                .await
            {
                Err(e) if e.is_node_exists() => client.set(path, value).await.map(|_| ()),
                Err(e) if e.is_no_node() => {
                    ensure_path(client, root).await?;
                    Err(e)
                }
                other => other,
            }
        })
        .await;

        match created {
            Ok(()) => {
                info!(node_id = %self.node_id, operation = %cluster, "joined cluster operation");
                self.local.operation_started(&cluster).await;
                self.participation = Some(Participation {
                    status: cluster,
                    performing: false,
                    completed: false,
                });
            }
            Err(e) => error!(operation = %cluster, error = %e, "failed to join cluster operation"),
        }
    }

    async fn leave(&mut self) {
        let Some(participation) = self.participation.take() else {
            return;
        };
        let client = self.client.as_ref();
        let path = self.node_path.as_str();
        let config = self.config.write_retry("delete node status");
        let deleted = retry(&config, || async move {
            match client.delete(path, None).await {
                Err(e) if e.is_no_node() => Ok(()),
                other => other,
            }
        })
        .await;
        if let Err(e) = deleted {
            warn!(error = %e, "failed to delete node status");
        }

        info!(
            node_id = %self.node_id,
            operation = %participation.status,
            completed = participation.completed,
            "left cluster operation"
        );
        self.local
            .operation_finished(&participation.status, participation.completed)
            .await;
    }

    /// Publish a new own state; a failed write escalates to Failed
    async fn write_state(&mut self, next: OperationState) -> bool {
        let Some(participation) = self.participation.as_mut() else {
            return false;
        };
        let status = participation.status.with_state(next);

        let client = self.client.as_ref();
        let path = self.node_path.as_str();
        let config = self.config.write_retry("write node status");
        let value = status.to_bytes();
        let value = value.as_slice();
        let written = retry(&config, || async move {
            put_value(client, path, value, NodeKind::Ephemeral).await
        })
        .await;

        match written {
            Ok(()) => {
                debug!(from = %participation.status.state, to = %next, "node status advanced");
                participation.status = status;
                true
            }
            Err(e) => {
                error!(status = %status, error = %e, "failed to write node status");
                if next != OperationState::Failed {
                    let failed = status.with_state(OperationState::Failed);
                    if put_value(client, path, &failed.to_bytes(), NodeKind::Ephemeral)
                        .await
                        .is_ok()
                    {
                        participation.status = failed;
                    }
                }
                false
            }
        }
    }

    fn begin_perform(&mut self) {
        let Some(participation) = self.participation.as_mut() else {
            return;
        };
        participation.performing = true;
        let status = participation.status.clone();
        let local = self.local.clone();
        let performed = self.perform_tx.clone();

        info!(operation = %status, "performing local operation");
        tokio::spawn(async move {
            let result = match (status.operation, &status.version) {
                (Operation::Reset, _) => local.perform_reset().await,
                (Operation::Update, Some(version)) => local.perform_update(version).await,
                _ => Err(UiUpdateError::Internal {
                    message: format!("cannot perform {}", status),
                }),
            };
            let _ = performed.send((status, result)).await;
        });
    }

    async fn on_performed(&mut self, status: OperationStatus, result: UiUpdateResult<()>) {
        let Some(participation) = self.participation.as_mut() else {
            return;
        };
        if !participation.status.same_operation(&status) {
            return;
        }
        participation.performing = false;

        let next = match result {
            Ok(()) => {
                info!(operation = %status, "local operation complete");
                OperationState::Complete
            }
            Err(e) => {
                error!(operation = %status, error = %e, "local operation failed");
                OperationState::Failed
            }
        };
        self.write_state(next).await;
    }

    /// Recreate the ephemeral status lost with an expired session
    async fn restore_node(&mut self) {
        let Some(participation) = &self.participation else {
            return;
        };
        match self.client.exists(&self.node_path).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let value = participation.status.to_bytes();
                match self
                    .client
                    .create(&self.node_path, &value, Permissions::All, NodeKind::Ephemeral)
                    .await
                {
                    Ok(()) => info!(status = %participation.status, "restored node status after reconnect"),
                    Err(e) => warn!(error = %e, "failed to restore node status"),
                }
            }
            Err(e) => warn!(error = %e, "failed to check node status after reconnect"),
        }
    }
}

fn joinable(cluster: &OperationStatus) -> bool {
    cluster.state == OperationState::Requested
        && matches!(cluster.operation, Operation::Update | Operation::Reset)
}

fn current_status(watcher: &NodeWatcher) -> OperationStatus {
    OperationStatus::from_bytes(&watcher.data())
}

fn status_of(update: &WatchUpdate<NodeValue>) -> OperationStatus {
    OperationStatus::from_bytes(&update.value.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationState::*;

    #[test]
    fn test_requested_transitions() {
        assert_eq!(
            next_node_state(Requested, InProgress),
            (InProgress, FollowerEffect::BeginPerform)
        );
        assert_eq!(
            next_node_state(Requested, Requested),
            (Requested, FollowerEffect::None)
        );
        assert_eq!(next_node_state(Requested, Failed), (Failed, FollowerEffect::None));
        assert_eq!(next_node_state(Requested, Idle), (Idle, FollowerEffect::Cleanup));
        assert_eq!(next_node_state(Requested, Complete), (Failed, FollowerEffect::None));
    }

    #[test]
    fn test_in_progress_waits_for_perform() {
        for cluster in [Requested, InProgress, Complete, Failed, Idle] {
            assert_eq!(
                next_node_state(InProgress, cluster),
                (InProgress, FollowerEffect::None)
            );
        }
    }

    #[test]
    fn test_complete_and_failed_clean_up() {
        assert_eq!(next_node_state(Complete, Complete), (Idle, FollowerEffect::Cleanup));
        assert_eq!(next_node_state(Complete, Failed), (Complete, FollowerEffect::None));
        for cluster in [Idle, Failed, Complete] {
            assert_eq!(next_node_state(Failed, cluster), (Idle, FollowerEffect::Cleanup));
        }
        assert_eq!(next_node_state(Failed, InProgress), (Failed, FollowerEffect::None));
    }

    #[test]
    fn test_joinable() {
        assert!(joinable(&OperationStatus::parse("Reset:Requested")));
        assert!(joinable(&OperationStatus::parse("Update:Requested:1.0")));
        assert!(!joinable(&OperationStatus::parse("Update:InProgress:1.0")));
        assert!(!joinable(&OperationStatus::idle()));
    }
}
