//! Registry-backed package loader
//!
//! Resolves the bundle URI of a version through the registry, downloads the
//! gzip tarball and unpacks it into the version directory.

use crate::error::{UiUpdateError, UiUpdateResult};
use crate::manager::PackageLoader;
use crate::registry::PackageRegistry;
use crate::types::UiVersion;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct RegistryPackageLoader {
    registry: Arc<dyn PackageRegistry>,
    http: reqwest::Client,
}

impl RegistryPackageLoader {
    pub fn new(
        registry: Arc<dyn PackageRegistry>,
        download_timeout: Duration,
    ) -> UiUpdateResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()
            .map_err(|e| UiUpdateError::ConfigurationError {
                component: "loader".to_string(),
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { registry, http })
    }
}

#[async_trait]
impl PackageLoader for RegistryPackageLoader {
    async fn load(&self, version: &UiVersion, target: &Path) -> UiUpdateResult<()> {
        let uri = self.registry.bundle_uri(version, None).await?;
        info!(version = %version, uri = %uri, "downloading UI bundle");

        let response = self
            .http
            .get(uri.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| UiUpdateError::CosmosRequestFailure {
                endpoint: uri.to_string(),
                message: e.to_string(),
            })?;
        let bytes = response.bytes().await?;

        let target = target.to_path_buf();
        let size = bytes.len();
        tokio::task::spawn_blocking(move || unpack(&bytes, &target)).await??;
        info!(version = %version, bytes = size, "unpacked UI bundle");
        Ok(())
    }
}

/// Unpack a gzip tarball into `target`
pub fn unpack(archive: &[u8], target: &Path) -> UiUpdateResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(archive)));
    archive.set_preserve_permissions(false);
    archive.unpack(target).map_err(|e| UiUpdateError::Internal {
        message: format!("unpacking into {}: {}", target.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn bundle(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_unpack_bundle() {
        let dir = TempDir::new().unwrap();
        let archive = bundle(&[("dist/index.html", b"<html></html>")]);
        unpack(&archive, dir.path()).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("dist/index.html")).unwrap(),
            b"<html></html>"
        );
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        assert!(unpack(b"not a tarball", dir.path()).is_err());
    }
}
