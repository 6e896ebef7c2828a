// Common test utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uiupdate_core::{
    error::{UiUpdateError, UiUpdateResult},
    loader::unpack,
    manager::{PackageLoader, UiPaths},
    operation::OperationConfig,
    registry::PackageRegistry,
    retry::BackoffConfig,
    zk::{MemoryClient, MemoryEnsemble, ZnodeLayout},
    UiAgent, UiVersion,
};
use url::Url;

pub const BASE_PATH: &str = "/dcos/ui-update";
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Registry that knows a fixed set of versions
pub struct StaticRegistry {
    versions: Vec<UiVersion>,
}

impl StaticRegistry {
    pub fn new(versions: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            versions: versions.iter().map(|v| UiVersion::new(*v)).collect(),
        })
    }
}

#[async_trait]
impl PackageRegistry for StaticRegistry {
    async fn list_versions(&self, _authorization: Option<&str>) -> UiUpdateResult<Vec<UiVersion>> {
        Ok(self.versions.clone())
    }

    async fn bundle_uri(
        &self,
        version: &UiVersion,
        _authorization: Option<&str>,
    ) -> UiUpdateResult<Url> {
        Url::parse(&format!("https://downloads.test/ui/{}.tar.gz", version.as_str())).map_err(|e| {
            UiUpdateError::UiPackageAssetBadUri {
                uri: version.as_str().to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// Loader reading `<version>.tar.gz` files from a local directory
pub struct DirectoryPackageLoader {
    dir: PathBuf,
}

impl DirectoryPackageLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PackageLoader for DirectoryPackageLoader {
    async fn load(&self, version: &UiVersion, target: &Path) -> UiUpdateResult<()> {
        let archive = self.dir.join(format!("{}.tar.gz", version.as_str()));
        let bytes = tokio::fs::read(&archive).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UiUpdateError::RequestedVersionNotFound {
                    version: version.as_str().to_string(),
                }
            } else {
                e.into()
            }
        })?;
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || unpack(&bytes, &target)).await?
    }
}

/// Loader writing a minimal `dist` directory
pub struct FakeLoader {
    delay: Duration,
    fail: bool,
    loads: AtomicUsize,
}

impl FakeLoader {
    pub fn new() -> Arc<Self> {
        Self::with(Duration::ZERO, false)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::with(delay, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::with(Duration::ZERO, true)
    }

    fn with(delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail,
            loads: AtomicUsize::new(0),
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageLoader for FakeLoader {
    async fn load(&self, version: &UiVersion, target: &Path) -> UiUpdateResult<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(UiUpdateError::Internal {
                message: format!("extracting {} failed", version),
            });
        }
        let dist = target.join("dist");
        tokio::fs::create_dir_all(&dist).await?;
        tokio::fs::write(dist.join("index.html"), version.as_str()).await?;
        Ok(())
    }
}

/// Filesystem layout of one master, served from the pre-bundled UI
pub fn ui_paths(dir: &TempDir) -> UiPaths {
    let root = dir.path();
    let default_doc_root = root.join("default");
    std::fs::create_dir_all(&default_doc_root).unwrap();
    std::fs::write(default_doc_root.join("index.html"), "pre-bundled").unwrap();
    let dist_symlink = root.join("dcos-ui-dist");
    std::os::unix::fs::symlink(&default_doc_root, &dist_symlink).unwrap();

    UiPaths {
        versions_root: root.join("versions"),
        default_doc_root,
        dist_symlink,
        dist_stage_symlink: root.join("new-dcos-ui-dist"),
    }
}

pub fn test_operation_config(timeout: Duration) -> OperationConfig {
    OperationConfig {
        timeout,
        poll_interval: Duration::from_millis(200),
        ..OperationConfig::default()
    }
}

pub fn quick_backoff() -> BackoffConfig {
    BackoffConfig {
        min: Duration::from_millis(10),
        max: Duration::from_millis(100),
        factor: 2.0,
        jitter: false,
    }
}

pub fn layout() -> ZnodeLayout {
    ZnodeLayout::new(BASE_PATH)
}

/// One master of a test cluster
pub struct TestMaster {
    pub agent: UiAgent,
    pub client: Arc<MemoryClient>,
    pub paths: UiPaths,
    pub dir: TempDir,
}

impl TestMaster {
    pub async fn start(
        ensemble: &MemoryEnsemble,
        node_id: &str,
        masters: usize,
        loader: Arc<dyn PackageLoader>,
        operation: OperationConfig,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = ui_paths(&dir);
        let client = ensemble.connect(BASE_PATH).await.unwrap();
        let agent = UiAgent::builder()
            .client(client.clone())
            .node_id(node_id)
            .masters(masters)
            .paths(paths.clone())
            .registry(StaticRegistry::new(&["2.24.4", "2.25.0"]))
            .loader(loader)
            .operation(operation)
            .poll_interval(Duration::from_millis(200))
            .connect_backoff(quick_backoff())
            .start()
            .await
            .unwrap();
        agent.ready().await.unwrap();
        Self {
            agent,
            client,
            paths,
            dir,
        }
    }

    /// Target of the serve symlink
    pub fn served(&self) -> PathBuf {
        std::fs::read_link(&self.paths.dist_symlink).unwrap()
    }

    pub fn version_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.paths.versions_root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
