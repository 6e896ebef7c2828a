//! Agent wiring
//!
//! [`UiAgent`] owns every long-running part of a master: the version store,
//! the operation follower, the service and the task that reconciles the
//! served UI with the cluster version.

use crate::config::AgentConfig;
use crate::error::{UiUpdateError, UiUpdateResult};
use crate::loader::RegistryPackageLoader;
use crate::manager::{PackageLoader, UiPaths, UpdateManager};
use crate::operation::{OperationConfig, OperationFollower, OperationLeader};
use crate::registry::{CosmosClient, PackageRegistry};
use crate::retry::BackoffConfig;
use crate::service::UiService;
use crate::types::UiVersion;
use crate::version_store::ZkVersionStore;
use crate::zk::{ZkClient, ZkConnection, ZnodeLayout};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

pub struct UiAgent {
    node_id: String,
    service: Arc<UiService>,
    version_store: Arc<ZkVersionStore>,
    follower: Option<OperationFollower>,
    reconciler: JoinHandle<()>,
}

impl UiAgent {
    pub fn builder() -> UiAgentBuilder {
        UiAgentBuilder::new()
    }

    /// Connect to the configured ensemble and registry and start the agent
    pub async fn from_config(config: &AgentConfig) -> UiUpdateResult<(Self, Arc<ZkConnection>)> {
        let node_id = config.node.node_id().await?;
        let masters = config.node.master_count().await?;
        info!(node_id = %node_id, masters, "starting UI update agent");

        let connection = ZkConnection::connect(config.zookeeper.connect_options()).await?;
        let registry: Arc<dyn PackageRegistry> = Arc::new(CosmosClient::new(&config.registry)?);
        let loader = RegistryPackageLoader::new(registry.clone(), config.registry.request_timeout)?;

        let agent = Self::builder()
            .client(connection.clone())
            .node_id(node_id)
            .masters(masters)
            .paths(config.ui.clone())
            .registry(registry)
            .loader(Arc::new(loader))
            .operation(config.operation.clone())
            .poll_interval(config.zookeeper.poll_interval)
            .start()
            .await?;
        Ok((agent, connection))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn service(&self) -> &Arc<UiService> {
        &self.service
    }

    pub fn version_store(&self) -> &Arc<ZkVersionStore> {
        &self.version_store
    }

    /// Wait until the cluster version is known
    pub async fn ready(&self) -> UiUpdateResult<UiVersion> {
        self.version_store.ready().await
    }

    /// Stop the follower, the version store and the reconciler
    pub async fn shutdown(mut self) {
        if let Some(follower) = self.follower.take() {
            follower.shutdown().await;
        }
        self.version_store.close();
        self.reconciler.abort();
        info!(node_id = %self.node_id, "UI update agent stopped");
    }
}

impl Drop for UiAgent {
    fn drop(&mut self) {
        self.reconciler.abort();
        self.version_store.close();
    }
}

/// Builder for [`UiAgent`]
pub struct UiAgentBuilder {
    client: Option<Arc<dyn ZkClient>>,
    node_id: Option<String>,
    masters: usize,
    paths: UiPaths,
    registry: Option<Arc<dyn PackageRegistry>>,
    loader: Option<Arc<dyn PackageLoader>>,
    operation: OperationConfig,
    poll_interval: Duration,
    connect_backoff: BackoffConfig,
}

impl UiAgentBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            node_id: None,
            masters: 1,
            paths: UiPaths::default(),
            registry: None,
            loader: None,
            operation: OperationConfig::default(),
            poll_interval: Duration::from_secs(30),
            connect_backoff: BackoffConfig::connect(),
        }
    }

    pub fn client(mut self, client: Arc<dyn ZkClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn masters(mut self, masters: usize) -> Self {
        self.masters = masters;
        self
    }

    pub fn paths(mut self, paths: UiPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn registry(mut self, registry: Arc<dyn PackageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn PackageLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn operation(mut self, operation: OperationConfig) -> Self {
        self.operation = operation;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn connect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.connect_backoff = backoff;
        self
    }

    /// Prepare the versions root and start every background part
    pub async fn start(self) -> UiUpdateResult<UiAgent> {
        let client = self.client.ok_or_else(|| missing("client"))?;
        let node_id = self.node_id.ok_or_else(|| missing("node_id"))?;
        let registry = self.registry.ok_or_else(|| missing("registry"))?;
        let loader = self.loader.ok_or_else(|| missing("loader"))?;
        if self.masters == 0 {
            return Err(UiUpdateError::ConfigurationError {
                component: "agent".to_string(),
                message: "master count must be at least 1".to_string(),
            });
        }

        let manager = Arc::new(UpdateManager::new(self.paths, loader)?);
        let local = manager.initialize().await?;
        info!(version = %local, "local UI version");

        let layout = ZnodeLayout::new(client.base_path());
        let version_store = ZkVersionStore::start(
            client.clone(),
            &layout,
            self.poll_interval,
            self.connect_backoff,
        );
        let leader = OperationLeader::new(
            client.clone(),
            layout.clone(),
            node_id.clone(),
            self.masters,
            self.operation.clone(),
            version_store.clone(),
        );
        let service = Arc::new(UiService::new(
            manager,
            registry,
            leader,
            version_store.clone(),
        ));
        let follower = OperationFollower::start(
            client,
            layout,
            node_id.clone(),
            self.operation,
            service.clone(),
        );

        let mut changes = version_store.watch_for_version_change();
        let reconciling = service.clone();
        let reconciler = tokio::spawn(async move {
            while let Some(version) = changes.recv().await {
                reconciling.version_changed(&version).await;
            }
        });

        Ok(UiAgent {
            node_id,
            service,
            version_store,
            follower: Some(follower),
            reconciler,
        })
    }
}

impl Default for UiAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(field: &str) -> UiUpdateError {
    UiUpdateError::ConfigurationError {
        component: "agent".to_string(),
        message: format!("{} is required", field),
    }
}
