//! UI service
//!
//! Glue between the HTTP surface and the core: admits at most one update or
//! reset at a time on this master, leads the cluster operation, performs the
//! local side of every operation as a follower and keeps the served UI in
//! line with the cluster version between operations.

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::manager::UpdateManager;
use crate::operation::{LocalOperations, Operation, OperationLeader, OperationStatus};
use crate::registry::PackageRegistry;
use crate::types::{OperationResult, UiVersion};
use crate::version_store::ZkVersionStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Build version reported by the version endpoint
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Served UI as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub default: bool,
    pub package_version: String,
    pub build_version: String,
}

/// Result of an update request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The cluster operation ran to its end
    Finished(OperationResult),
    /// The registry does not know the version
    VersionNotFound,
    /// The same version is already being installed
    AlreadyInProgress,
    /// Another operation holds this master or the cluster
    Conflict,
}

/// Result of a reset request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Finished(OperationResult),
    Conflict,
}

/// Operation admitted on this master
#[derive(Debug, Clone, PartialEq, Eq)]
struct Admitted {
    operation: Operation,
    version: Option<UiVersion>,
}

/// Clears the admission gate when the request ends
struct GateGuard<'a> {
    gate: &'a Mutex<Option<Admitted>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.lock().take();
    }
}

pub struct UiService {
    manager: Arc<UpdateManager>,
    registry: Arc<dyn PackageRegistry>,
    leader: OperationLeader,
    version_store: Arc<ZkVersionStore>,
    gate: Mutex<Option<Admitted>>,
    /// This master takes part in a cluster operation
    participating: AtomicBool,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl UiService {
    pub fn new(
        manager: Arc<UpdateManager>,
        registry: Arc<dyn PackageRegistry>,
        leader: OperationLeader,
        version_store: Arc<ZkVersionStore>,
    ) -> Self {
        Self {
            manager,
            registry,
            leader,
            version_store,
            gate: Mutex::new(None),
            participating: AtomicBool::new(false),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &Arc<UpdateManager> {
        &self.manager
    }

    /// Version served by this master
    pub async fn version_info(&self) -> UiUpdateResult<VersionInfo> {
        let current = self.manager.current_version().await?;
        Ok(VersionInfo {
            default: current.is_prebundled(),
            package_version: current.as_str().to_string(),
            build_version: BUILD_VERSION.to_string(),
        })
    }

    fn admit(&self, requested: Admitted) -> Result<GateGuard<'_>, Admitted> {
        let mut gate = self.gate.lock();
        if let Some(active) = gate.as_ref() {
            return Err(active.clone());
        }
        *gate = Some(requested);
        Ok(GateGuard { gate: &self.gate })
    }

    /// Update every master to `version`
    ///
    /// `authorization` is forwarded to the registry for the version check.
    pub async fn update(
        &self,
        version: &UiVersion,
        authorization: Option<&str>,
    ) -> UiUpdateResult<UpdateOutcome> {
        let requested = Admitted {
            operation: Operation::Update,
            version: Some(version.clone()),
        };
        let _guard = match self.admit(requested.clone()) {
            Ok(guard) => guard,
            Err(active) if active == requested => {
                debug!(version = %version, "update already in progress");
                return Ok(UpdateOutcome::AlreadyInProgress);
            }
            Err(active) => {
                debug!(active = ?active, requested = %version, "another operation in progress");
                return Ok(UpdateOutcome::Conflict);
            }
        };

        if version.is_prebundled() || version.validate().is_err() {
            info!(version = %version, "rejecting unusable version");
            return Ok(UpdateOutcome::VersionNotFound);
        }
        if !self.registry.has_version(version, authorization).await? {
            info!(version = %version, "requested version not in registry");
            return Ok(UpdateOutcome::VersionNotFound);
        }

        match self.leader.run(Operation::Update, Some(version.clone())).await {
            Ok(result) => Ok(UpdateOutcome::Finished(result)),
            Err(UiUpdateError::ClusterLockNotAvailable { current }) => {
                info!(current = %current, "cluster busy with another operation");
                Ok(UpdateOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Reset every master to the pre-bundled UI
    pub async fn reset(&self) -> UiUpdateResult<ResetOutcome> {
        let requested = Admitted {
            operation: Operation::Reset,
            version: None,
        };
        let _guard = match self.admit(requested) {
            Ok(guard) => guard,
            Err(active) => {
                debug!(active = ?active, "another operation in progress");
                return Ok(ResetOutcome::Conflict);
            }
        };

        match self.leader.run(Operation::Reset, None).await {
            Ok(result) => Ok(ResetOutcome::Finished(result)),
            Err(UiUpdateError::ClusterLockNotAvailable { current }) => {
                info!(current = %current, "cluster busy with another operation");
                Ok(ResetOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    /// Serve `version` locally unless an operation is running
    pub async fn version_changed(&self, version: &UiVersion) {
        if self.participating.load(Ordering::SeqCst) {
            debug!(version = %version, "operation active, deferring reconciliation");
            return;
        }
        if let Err(e) = self.reconcile(version).await {
            error!(version = %version, error = %e, "failed to serve cluster version");
        }
    }

    /// Bring the served UI in line with `version`
    pub async fn reconcile(&self, version: &UiVersion) -> UiUpdateResult<()> {
        let _guard = self.reconcile_lock.lock().await;

        let current = self.manager.current_version().await?;
        if current == *version {
            return Ok(());
        }
        info!(current = %current, cluster = %version, "reconciling served UI");
        if version.is_prebundled() {
            self.manager.reset_to_prebundled().await
        } else {
            self.install(version).await.map(|_| ())
        }
    }

    async fn install(&self, version: &UiVersion) -> UiUpdateResult<bool> {
        let manager = self.manager.as_ref();
        manager
            .update_to_version(version, |dist| async move { manager.publish(&dist).await })
            .await
    }
}

#[async_trait]
impl LocalOperations for UiService {
    async fn operation_started(&self, status: &OperationStatus) {
        self.participating.store(true, Ordering::SeqCst);
        info!(operation = %status, "joined cluster operation");
    }

    async fn perform_reset(&self) -> UiUpdateResult<()> {
        self.manager.reset_to_prebundled().await
    }

    async fn perform_update(&self, version: &UiVersion) -> UiUpdateResult<()> {
        self.install(version).await.map(|_| ())
    }

    async fn operation_finished(&self, status: &OperationStatus, completed: bool) {
        self.participating.store(false, Ordering::SeqCst);
        info!(operation = %status, completed, "left cluster operation");

        // A completed operation already persisted its version; the store may lag behind.
        let persisted = match (completed, status.operation) {
            (true, Operation::Update) => status.version.clone(),
            (true, Operation::Reset) => Some(UiVersion::prebundled()),
            _ => None,
        };
        let target = match persisted {
            Some(version) => Ok(version),
            None => self.version_store.current_version(),
        };
        match target {
            Ok(version) => {
                if let Err(e) = self.reconcile(&version).await {
                    error!(version = %version, error = %e, "failed to serve cluster version");
                }
            }
            Err(e) => warn!(error = %e, "cluster version unknown, skipping reconciliation"),
        }
    }
}
