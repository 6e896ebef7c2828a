//! Local UI versions
//!
//! Downloaded versions live under the versions root as
//! `<versions root>/<version>/dist`. The serve symlink points either at one of
//! those `dist` directories or at the pre-bundled default doc root. Every
//! mutation of the versions root, and every read of the serve symlink, goes
//! through a single lock so no reader observes an intermediate state.

pub mod publish;

pub use publish::publish;

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::types::UiVersion;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DIST_DIR: &str = "dist";

/// Filesystem locations the manager works with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiPaths {
    /// Holds one directory per downloaded version
    pub versions_root: PathBuf,
    /// Pre-bundled UI shipped with the host
    pub default_doc_root: PathBuf,
    /// Symlink served by the web server
    pub dist_symlink: PathBuf,
    /// Transient symlink used for the atomic swap
    pub dist_stage_symlink: PathBuf,
}

impl Default for UiPaths {
    fn default() -> Self {
        Self {
            versions_root: PathBuf::from("/opt/mesosphere/active/dcos-ui-service/versions"),
            default_doc_root: PathBuf::from("/opt/mesosphere/active/dcos-ui/usr"),
            dist_symlink: PathBuf::from("/opt/mesosphere/active/dcos-ui-dist"),
            dist_stage_symlink: PathBuf::from("/opt/mesosphere/active/new-dcos-ui-dist"),
        }
    }
}

impl UiPaths {
    /// Reject versions roots whose cleanup could delete unrelated files
    pub fn validate(&self) -> UiUpdateResult<()> {
        let root = &self.versions_root;
        let dangerous = !root.is_absolute()
            || root.components().all(|c| matches!(c, Component::RootDir))
            || root.components().any(|c| matches!(c, Component::ParentDir))
            || self.default_doc_root.starts_with(root)
            || self.dist_symlink.starts_with(root)
            || self.dist_stage_symlink.starts_with(root);
        if dangerous {
            return Err(UiUpdateError::PotentiallyDangerousVersionsRoot { path: root.clone() });
        }
        Ok(())
    }

    /// Directory of a downloaded version, always a direct child of the versions root
    pub fn version_dir(&self, version: &UiVersion) -> UiUpdateResult<PathBuf> {
        version.validate()?;
        if version.is_prebundled() {
            return Err(UiUpdateError::RequestedVersionNotFound {
                version: String::new(),
            });
        }
        Ok(self.versions_root.join(version.as_str()))
    }

    pub fn version_dist(&self, version: &UiVersion) -> UiUpdateResult<PathBuf> {
        Ok(self.version_dir(version)?.join(DIST_DIR))
    }
}

/// Fetches a version and unpacks it so that `<target>/dist` holds the UI
#[async_trait]
pub trait PackageLoader: Send + Sync {
    async fn load(&self, version: &UiVersion, target: &Path) -> UiUpdateResult<()>;
}

/// Owns the versions root and the serve symlink
pub struct UpdateManager {
    paths: UiPaths,
    loader: Arc<dyn PackageLoader>,
    lock: Mutex<()>,
}

impl UpdateManager {
    pub fn new(paths: UiPaths, loader: Arc<dyn PackageLoader>) -> UiUpdateResult<Self> {
        paths.validate()?;
        Ok(Self {
            paths,
            loader,
            lock: Mutex::new(()),
        })
    }

    pub fn paths(&self) -> &UiPaths {
        &self.paths
    }

    /// Prepare the versions root and clear what an interrupted run left behind
    ///
    /// Creates the versions root, removes a stale stage symlink and, when more
    /// than one version directory is present, keeps only the served one.
    pub async fn initialize(&self) -> UiUpdateResult<UiVersion> {
        let _guard = self.lock.lock().await;

        tokio::fs::create_dir_all(&self.paths.versions_root)
            .await
            .map_err(|e| UiUpdateError::CouldNotCreateNewVersionDirectory {
                path: self.paths.versions_root.clone(),
                source: e,
            })?;

        if tokio::fs::symlink_metadata(&self.paths.dist_stage_symlink)
            .await
            .is_ok()
        {
            warn!(path = %self.paths.dist_stage_symlink.display(), "removing stale stage symlink");
            tokio::fs::remove_file(&self.paths.dist_stage_symlink).await?;
        }

        let current = self.current_version_locked().await?;
        let versions = self.list_versions_locked().await?;
        if versions.len() > 1 {
            let found = UiUpdateError::MultipleVersionFound {
                versions: versions.iter().map(|v| v.as_str().to_string()).collect(),
            };
            warn!(error = %found, current = %current, "cleaning up versions root");
            self.remove_all_except_locked(&current).await?;
        }
        Ok(current)
    }

    /// Version currently served
    pub async fn current_version(&self) -> UiUpdateResult<UiVersion> {
        let _guard = self.lock.lock().await;
        self.current_version_locked().await
    }

    async fn current_version_locked(&self) -> UiUpdateResult<UiVersion> {
        let target = match tokio::fs::read_link(&self.paths.dist_symlink).await {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(UiUpdateError::UiDistSymlinkNotFound {
                    path: self.paths.dist_symlink.clone(),
                })
            }
            Err(e) => {
                return Err(UiUpdateError::CouldNotGetCurrentVersion {
                    reason: format!("reading {}: {}", self.paths.dist_symlink.display(), e),
                })
            }
        };
        version_from_target(&self.paths, &target)
    }

    /// Download `version`, hand its `dist` directory to `on_ready` and drop the previous version
    ///
    /// Returns `false` without touching anything when `version` is already
    /// served. A failure removes the partially created version directory.
    pub async fn update_to_version<F, Fut>(
        &self,
        version: &UiVersion,
        on_ready: F,
    ) -> UiUpdateResult<bool>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = UiUpdateResult<()>> + Send,
    {
        let _guard = self.lock.lock().await;

        version.validate()?;
        let current = self.current_version_locked().await?;
        if current == *version {
            debug!(version = %version, "version already served");
            return Ok(false);
        }

        let dir = self.paths.version_dir(version)?;
        if tokio::fs::metadata(&dir).await.is_ok() {
            debug!(dir = %dir.display(), "removing leftover version directory");
            remove_dir(version, &dir).await?;
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UiUpdateError::CouldNotCreateNewVersionDirectory {
                path: dir.clone(),
                source: e,
            })?;

        info!(version = %version, dir = %dir.display(), "loading UI package");
        let loaded = self.loader.load(version, &dir).await;
        let ready = match loaded {
            Ok(()) => {
                let dist = dir.join(DIST_DIR);
                if tokio::fs::metadata(&dist).await.map(|m| m.is_dir()).unwrap_or(false) {
                    on_ready(dist).await
                } else {
                    Err(UiUpdateError::CouldNotGetCurrentVersion {
                        reason: format!("package {} has no {} directory", version, DIST_DIR),
                    })
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = ready {
            if let Err(cleanup) = remove_dir(version, &dir).await {
                warn!(error = %cleanup, "failed to remove failed version directory");
            }
            return Err(e);
        }

        if !current.is_prebundled() {
            let removed = match self.paths.version_dir(&current) {
                Ok(previous) => remove_dir(&current, &previous).await,
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                warn!(error = %e, "previous version left behind");
            }
        }
        info!(version = %version, previous = %current, "UI version updated");
        Ok(true)
    }

    /// Atomically serve `dist`
    pub async fn publish(&self, dist: &Path) -> UiUpdateResult<()> {
        publish(
            dist,
            &self.paths.dist_stage_symlink,
            &self.paths.dist_symlink,
        )
        .await
    }

    /// Serve the pre-bundled UI and remove every downloaded version
    pub async fn reset_to_prebundled(&self) -> UiUpdateResult<()> {
        let _guard = self.lock.lock().await;

        let current = self.current_version_locked().await?;
        if !current.is_prebundled() {
            self.publish(&self.paths.default_doc_root).await?;
            info!(previous = %current, "serving pre-bundled UI");
        }
        self.remove_all_except_locked(&UiVersion::prebundled())
            .await
    }

    /// Remove the directory of `version`
    pub async fn remove_version(&self, version: &UiVersion) -> UiUpdateResult<()> {
        let _guard = self.lock.lock().await;

        let dir = self.paths.version_dir(version)?;
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(UiUpdateError::RequestedVersionNotFound {
                version: version.as_str().to_string(),
            });
        }
        remove_dir(version, &dir).await
    }

    /// Remove every version directory except the one of `keep`
    pub async fn remove_all_versions_except(&self, keep: &UiVersion) -> UiUpdateResult<()> {
        let _guard = self.lock.lock().await;
        self.remove_all_except_locked(keep).await
    }

    async fn remove_all_except_locked(&self, keep: &UiVersion) -> UiUpdateResult<()> {
        for version in self.list_versions_locked().await? {
            if version == *keep {
                continue;
            }
            let dir = self.paths.version_dir(&version)?;
            remove_dir(&version, &dir).await?;
        }
        Ok(())
    }

    /// Version directories present under the versions root
    pub async fn list_versions(&self) -> UiUpdateResult<Vec<UiVersion>> {
        let _guard = self.lock.lock().await;
        self.list_versions_locked().await
    }

    async fn list_versions_locked(&self) -> UiUpdateResult<Vec<UiVersion>> {
        let root = &self.paths.versions_root;
        let reading = |e: std::io::Error| {
            if e.kind() == ErrorKind::NotFound {
                UiUpdateError::VersionsPathDoesNotExist { path: root.clone() }
            } else {
                UiUpdateError::ReadingVersions {
                    path: root.clone(),
                    source: e,
                }
            }
        };

        let mut entries = tokio::fs::read_dir(root).await.map_err(reading)?;
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(reading)? {
            if entry.file_type().await.map_err(reading)?.is_dir() {
                versions.push(UiVersion::new(entry.file_name().to_string_lossy()));
            }
        }
        versions.sort();
        Ok(versions)
    }
}

/// Map a serve-symlink target back to the version it serves
fn version_from_target(paths: &UiPaths, target: &Path) -> UiUpdateResult<UiVersion> {
    if target == paths.default_doc_root {
        return Ok(UiVersion::prebundled());
    }

    let not_a_version = || UiUpdateError::CouldNotGetCurrentVersion {
        reason: format!("{} is not a version directory", target.display()),
    };
    if target.file_name().and_then(|name| name.to_str()) != Some(DIST_DIR) {
        return Err(not_a_version());
    }
    let version_dir = target.parent().ok_or_else(not_a_version)?;
    if version_dir.parent() != Some(paths.versions_root.as_path()) {
        return Err(not_a_version());
    }
    version_dir
        .file_name()
        .and_then(|name| name.to_str())
        .map(UiVersion::new)
        .ok_or_else(not_a_version)
}

async fn remove_dir(version: &UiVersion, dir: &Path) -> UiUpdateResult<()> {
    tokio::fs::remove_dir_all(dir)
        .await
        .map_err(|e| UiUpdateError::RemovingVersion {
            version: version.as_str().to_string(),
            source: e,
        })?;
    debug!(dir = %dir.display(), "removed version directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> UiPaths {
        UiPaths {
            versions_root: PathBuf::from("/var/lib/ui/versions"),
            default_doc_root: PathBuf::from("/usr/share/ui"),
            dist_symlink: PathBuf::from("/var/lib/ui/dist"),
            dist_stage_symlink: PathBuf::from("/var/lib/ui/dist.new"),
        }
    }

    #[test]
    fn test_version_from_target() {
        let paths = paths();
        assert!(version_from_target(&paths, Path::new("/usr/share/ui"))
            .unwrap()
            .is_prebundled());
        assert_eq!(
            version_from_target(&paths, Path::new("/var/lib/ui/versions/2.24.4/dist")).unwrap(),
            UiVersion::new("2.24.4")
        );
        assert!(version_from_target(&paths, Path::new("/var/lib/ui/versions/2.24.4/build")).is_err());
        assert!(version_from_target(&paths, Path::new("/elsewhere/2.24.4/dist")).is_err());
    }

    #[test]
    fn test_version_dir_stays_under_root() {
        let paths = paths();
        assert_eq!(
            paths.version_dir(&UiVersion::new("2.24.4")).unwrap(),
            PathBuf::from("/var/lib/ui/versions/2.24.4")
        );
        for version in ["..", ".", "/etc", "../dist", ""] {
            assert!(
                matches!(
                    paths.version_dir(&UiVersion::new(version)),
                    Err(UiUpdateError::RequestedVersionNotFound { .. })
                ),
                "{:?}",
                version
            );
        }
    }

    #[test]
    fn test_dangerous_versions_roots() {
        let mut paths = paths();
        assert!(paths.validate().is_ok());

        paths.versions_root = PathBuf::from("/");
        assert!(matches!(
            paths.validate(),
            Err(UiUpdateError::PotentiallyDangerousVersionsRoot { .. })
        ));

        paths.versions_root = PathBuf::from("relative/versions");
        assert!(paths.validate().is_err());

        paths.versions_root = PathBuf::from("/usr");
        assert!(paths.validate().is_err());
    }
}
