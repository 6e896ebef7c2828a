//! Operation leader
//!
//! The leader takes the cluster lock by moving `cluster-status` from idle to
//! `<op>:Requested` with a version-checked write, then advances it as the
//! per-node statuses reach quorum. It always finishes by writing the `Idle`
//! sentinel back and clearing `update-leader`, whatever the outcome.

use super::status::{Operation, OperationState, OperationStatus};
use super::{put_value, OperationConfig};
use crate::error::{UiUpdateError, UiUpdateResult};
use crate::retry::retry;
use crate::types::{OperationResult, UiVersion};
use crate::version_store::ZkVersionStore;
use crate::watcher::{ChildrenWatcher, NodeValue, NodeWatcher, WatchUpdate};
use crate::zk::{ensure_path, NodeKind, Permissions, ZkClient, ZnodeLayout};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Per-node states of the operation in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub requested: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub failed: usize,
    pub idle: usize,
}

impl StatusCounts {
    /// Count the statuses that belong to `operation`; others are skipped
    pub fn tally<'a>(
        statuses: impl IntoIterator<Item = &'a OperationStatus>,
        operation: &OperationStatus,
    ) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            if !status.same_operation(operation) {
                continue;
            }
            match status.state {
                OperationState::Requested => counts.requested += 1,
                OperationState::InProgress => counts.in_progress += 1,
                OperationState::Complete => counts.complete += 1,
                OperationState::Failed => counts.failed += 1,
                OperationState::Idle => counts.idle += 1,
                OperationState::Ready | OperationState::Unknown => {}
            }
        }
        counts
    }
}

/// Next cluster state given the per-node counts, if the quorum allows a move
///
/// A single failed node fails the whole operation.
pub fn next_cluster_state(
    current: OperationState,
    counts: &StatusCounts,
    masters: usize,
) -> Option<OperationState> {
    match current {
        OperationState::Requested if counts.requested >= masters => {
            Some(OperationState::InProgress)
        }
        OperationState::InProgress if counts.failed >= 1 => Some(OperationState::Failed),
        OperationState::InProgress if counts.complete >= masters => Some(OperationState::Complete),
        OperationState::Complete if counts.idle >= masters => Some(OperationState::Idle),
        OperationState::Failed if counts.failed + counts.complete + counts.idle >= masters => {
            Some(OperationState::Idle)
        }
        _ => None,
    }
}

/// Drives one operation at a time from this master
pub struct OperationLeader {
    client: Arc<dyn ZkClient>,
    layout: ZnodeLayout,
    node_id: String,
    masters: usize,
    config: OperationConfig,
    version_store: Arc<ZkVersionStore>,
}

/// Per-node watchers and the statuses they last reported
#[derive(Default)]
struct Tracked {
    watchers: HashMap<String, NodeWatcher>,
    statuses: HashMap<String, OperationStatus>,
}

impl Tracked {
    fn record(&mut self, update: WatchUpdate<NodeValue>) {
        let Some(name) = update.path.rsplit('/').next() else {
            return;
        };
        if !self.watchers.contains_key(name) {
            return;
        }
        if update.value.exists() {
            let status = OperationStatus::from_bytes(&update.value.data);
            debug!(node = %name, status = %status, "node status changed");
            self.statuses.insert(name.to_string(), status);
        } else {
            self.statuses.remove(name);
        }
    }

    fn close(&mut self) {
        for watcher in self.watchers.values() {
            watcher.close();
        }
        self.watchers.clear();
    }
}

enum Outcome {
    /// Reached Idle; true when coming from Complete
    Finished(bool),
    TimedOut,
    Aborted(String),
}

impl OperationLeader {
    pub fn new(
        client: Arc<dyn ZkClient>,
        layout: ZnodeLayout,
        node_id: impl Into<String>,
        masters: usize,
        config: OperationConfig,
        version_store: Arc<ZkVersionStore>,
    ) -> Self {
        Self {
            client,
            layout,
            node_id: node_id.into(),
            masters: masters.max(1),
            config,
            version_store,
        }
    }

    pub fn masters(&self) -> usize {
        self.masters
    }

    /// Run `operation` across the cluster
    ///
    /// Fails with `ClusterLockNotAvailable` when another operation holds the
    /// cluster status; every other failure is reported in the result.
    pub async fn run(
        &self,
        operation: Operation,
        version: Option<UiVersion>,
    ) -> UiUpdateResult<OperationResult> {
        let target = OperationStatus::new(operation, OperationState::Requested, version);
        let deadline = Instant::now() + self.config.timeout;

        self.acquire(&target).await?;
        info!(
            operation = %target,
            node_id = %self.node_id,
            masters = self.masters,
            "leading cluster operation"
        );

        let outcome = self.drive(&target, deadline).await;
        self.cleanup().await;

        let result = match outcome {
            Outcome::Finished(true) => OperationResult::ok(),
            Outcome::Finished(false) => {
                OperationResult::failed(format!("{} operation failed", operation))
            }
            Outcome::TimedOut => {
                OperationResult::failed(format!("{} operation timed out", operation))
            }
            Outcome::Aborted(reason) => {
                OperationResult::failed(format!("{} operation failed: {}", operation, reason))
            }
        };
        info!(operation = %operation, successful = result.successful, message = %result.message, "cluster operation finished");
        Ok(result)
    }

    /// Move the cluster status from idle to `target` unless someone else holds it
    async fn acquire(&self, target: &OperationStatus) -> UiUpdateResult<()> {
        let client = self.client.as_ref();
        let path = self.layout.cluster_status();
        let path = path.as_str();
        let value = target.to_bytes();
        let value = value.as_slice();
        let config = self
            .config
            .init_retry("acquire cluster lock")
            .with_retryable(UiUpdateError::is_connection_error);

        retry(&config, || async move {
            match client.exists(path).await? {
                None => client
                    .create(path, value, Permissions::All, NodeKind::Persistent)
                    .await
                    .map_err(|e| {
                        if e.is_node_exists() {
                            UiUpdateError::ClusterLockNotAvailable {
                                current: "taken concurrently".to_string(),
                            }
                        } else {
                            e
                        }
                    }),
                Some(_) => {
                    let (data, stat) = client.get(path).await?;
                    let current = OperationStatus::from_bytes(&data);
                    if !current.is_idle() {
                        return Err(UiUpdateError::ClusterLockNotAvailable {
                            current: current.to_string(),
                        });
                    }
                    client
                        .set_versioned(path, value, stat.version)
                        .await
                        .map(|_| ())
                        .map_err(|e| {
                            if e.is_bad_version() {
                                UiUpdateError::ClusterLockNotAvailable {
                                    current: "taken concurrently".to_string(),
                                }
                            } else {
                                e
                            }
                        })
                }
            }
        })
        .await
    }

    async fn drive(&self, target: &OperationStatus, deadline: Instant) -> Outcome {
        if let Err(e) = self
            .write_with_retry(&self.layout.update_leader(), self.node_id.as_bytes())
            .await
        {
            error!(error = %e, "failed to stamp update leader");
            self.fail_fast(target).await;
            return Outcome::Aborted(e.to_string());
        }

        let root = self.layout.node_status_root();
        if let Err(e) = ensure_path(self.client.as_ref(), &root).await {
            error!(error = %e, "failed to create node status root");
            self.fail_fast(target).await;
            return Outcome::Aborted(e.to_string());
        }

        let (children_tx, mut children_rx) = mpsc::channel(16);
        let children = match ChildrenWatcher::create(
            self.client.clone(),
            &root,
            self.config.poll_interval,
            children_tx,
        )
        .await
        {
            Ok(children) => children,
            Err(e) => {
                error!(error = %e, "failed to watch node statuses");
                self.fail_fast(target).await;
                return Outcome::Aborted(e.to_string());
            }
        };

        let (node_tx, mut node_rx) = mpsc::channel(64);
        let mut tracked = Tracked::default();
        self.track(&mut tracked, children.value(), &node_tx).await;

        let mut state = OperationState::Requested;
        let timeout = sleep_until(deadline);
        tokio::pin!(timeout);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if let Some(successful) = self.advance(target, &mut state, &tracked).await {
                break Outcome::Finished(successful);
            }

            tokio::select! {
                _ = &mut timeout => {
                    warn!(operation = %target.operation, state = %state, "cluster operation timed out");
                    break Outcome::TimedOut;
                }
                update = children_rx.recv() => match update {
                    Some(update) => self.track(&mut tracked, update.value, &node_tx).await,
                    None => break Outcome::Aborted("node status watcher stopped".to_string()),
                },
                Some(update) = node_rx.recv() => tracked.record(update),
                _ = ticker.tick() => self.track(&mut tracked, children.value(), &node_tx).await,
            }
        };

        children.close();
        tracked.close();
        outcome
    }

    /// Follow the current children, opening a watcher per new node
    async fn track(
        &self,
        tracked: &mut Tracked,
        children: Vec<String>,
        node_tx: &mpsc::Sender<WatchUpdate<NodeValue>>,
    ) {
        tracked.watchers.retain(|name, _| children.contains(name));
        tracked.statuses.retain(|name, _| children.contains(name));

        for child in children {
            if tracked.watchers.contains_key(&child) {
                continue;
            }
            let path = self.layout.node_status(&child);
            match NodeWatcher::create(
                self.client.clone(),
                &path,
                self.config.poll_interval,
                node_tx.clone(),
            )
            .await
            {
                Ok(watcher) => {
                    let value = watcher.value();
                    if value.exists() {
                        let status = OperationStatus::from_bytes(&value.data);
                        debug!(node = %child, status = %status, "tracking node status");
                        tracked.statuses.insert(child.clone(), status);
                    }
                    tracked.watchers.insert(child, watcher);
                }
                Err(e) => warn!(node = %child, error = %e, "failed to watch node status"),
            }
        }
    }

    /// Apply every transition the current counts allow
    ///
    /// Returns the success flag once the operation reached Idle.
    async fn advance(
        &self,
        target: &OperationStatus,
        state: &mut OperationState,
        tracked: &Tracked,
    ) -> Option<bool> {
        loop {
            let counts = StatusCounts::tally(tracked.statuses.values(), target);
            let mut next = next_cluster_state(*state, &counts, self.masters)?;

            if next == OperationState::Complete {
                if let Err(e) = self.persist_version(target).await {
                    error!(error = %e, "failed to record the new cluster version");
                    next = OperationState::Failed;
                }
            }

            let status = target.with_state(next);
            if let Err(e) = self
                .write_with_retry(&self.layout.cluster_status(), &status.to_bytes())
                .await
            {
                error!(status = %status, error = %e, "failed to write cluster status");
                if next == OperationState::Failed || !self.write_failed(target).await {
                    return Some(false);
                }
                next = OperationState::Failed;
            }

            info!(from = %state, to = %next, counts = ?counts, "cluster operation advanced");
            let previous = std::mem::replace(state, next);
            if next == OperationState::Idle {
                return Some(previous == OperationState::Complete);
            }
        }
    }

    async fn persist_version(&self, target: &OperationStatus) -> UiUpdateResult<()> {
        let version = match target.operation {
            Operation::Update => target.version.clone().unwrap_or_default(),
            _ => UiVersion::prebundled(),
        };
        let store = self.version_store.as_ref();
        let config = self.config.write_retry("write cluster version");
        retry(&config, || store.update_current_version(&version)).await
    }

    async fn write_failed(&self, target: &OperationStatus) -> bool {
        let status = target.with_state(OperationState::Failed);
        self.write_with_retry(&self.layout.cluster_status(), &status.to_bytes())
            .await
            .is_ok()
    }

    /// Mark the operation failed before it got going
    async fn fail_fast(&self, target: &OperationStatus) {
        if !self.write_failed(target).await {
            warn!("could not mark aborted operation as failed");
        }
    }

    async fn write_with_retry(&self, path: &str, value: &[u8]) -> UiUpdateResult<()> {
        let client = self.client.as_ref();
        let config = self.config.write_retry(&format!("write {}", path));
        retry(&config, || async move {
            put_value(client, path, value, NodeKind::Persistent).await
        })
        .await
    }

    /// Release the cluster status and the leader stamp
    async fn cleanup(&self) {
        let idle = OperationStatus::idle().to_bytes();
        if let Err(e) = self
            .write_with_retry(&self.layout.cluster_status(), &idle)
            .await
        {
            error!(error = %e, "failed to reset cluster status");
        }
        if let Err(e) = self.write_with_retry(&self.layout.update_leader(), b"").await {
            error!(error = %e, "failed to clear update leader");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(requested: usize, complete: usize, failed: usize, idle: usize) -> StatusCounts {
        StatusCounts {
            requested,
            in_progress: 0,
            complete,
            failed,
            idle,
        }
    }

    #[test]
    fn test_requested_waits_for_every_master() {
        assert_eq!(
            next_cluster_state(OperationState::Requested, &counts(2, 0, 0, 0), 3),
            None
        );
        assert_eq!(
            next_cluster_state(OperationState::Requested, &counts(3, 0, 0, 0), 3),
            Some(OperationState::InProgress)
        );
    }

    #[test]
    fn test_single_master_quorum() {
        assert_eq!(
            next_cluster_state(OperationState::Requested, &counts(1, 0, 0, 0), 1),
            Some(OperationState::InProgress)
        );
        assert_eq!(
            next_cluster_state(OperationState::InProgress, &counts(0, 1, 0, 0), 1),
            Some(OperationState::Complete)
        );
        assert_eq!(
            next_cluster_state(OperationState::Complete, &counts(0, 0, 0, 1), 1),
            Some(OperationState::Idle)
        );
    }

    #[test]
    fn test_one_failure_fails_in_progress() {
        assert_eq!(
            next_cluster_state(OperationState::InProgress, &counts(0, 2, 1, 0), 3),
            Some(OperationState::Failed)
        );
    }

    #[test]
    fn test_failed_settles_when_everyone_is_done() {
        assert_eq!(
            next_cluster_state(OperationState::Failed, &counts(0, 1, 1, 0), 3),
            None
        );
        assert_eq!(
            next_cluster_state(OperationState::Failed, &counts(0, 2, 0, 1), 3),
            Some(OperationState::Idle)
        );
    }

    #[test]
    fn test_tally_skips_other_operations() {
        let target = OperationStatus::parse("Update:Requested:1.0");
        let statuses = vec![
            OperationStatus::parse("Update:Requested:1.0"),
            OperationStatus::parse("Update:Complete:1.0"),
            OperationStatus::parse("Update:Requested:2.0"),
            OperationStatus::parse("Reset:Failed"),
        ];
        let counts = StatusCounts::tally(&statuses, &target);
        assert_eq!(counts.requested, 1);
        assert_eq!(counts.complete, 1);
        assert_eq!(counts.failed, 0);
    }
}
