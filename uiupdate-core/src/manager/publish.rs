//! Atomic serve-symlink swap
//!
//! A new UI is published by pointing a stage symlink at it and renaming the
//! stage symlink over the serve symlink. The rename is atomic, so the web
//! server never observes a missing or half-written link.

use crate::error::{UiUpdateError, UiUpdateResult};
use std::path::Path;
use tracing::{debug, warn};

/// Point `serve` at `target` through `stage`
///
/// Fails if `stage` already exists. On a failed rename the stage symlink is
/// removed again.
pub async fn publish(target: &Path, stage: &Path, serve: &Path) -> UiUpdateResult<()> {
    tokio::fs::symlink(target, stage)
        .await
        .map_err(|e| UiUpdateError::Publish {
            target: target.to_path_buf(),
            reason: format!("creating stage symlink {}: {}", stage.display(), e),
        })?;

    if let Err(e) = tokio::fs::rename(stage, serve).await {
        if let Err(cleanup) = tokio::fs::remove_file(stage).await {
            warn!(stage = %stage.display(), error = %cleanup, "failed to remove stage symlink");
        }
        return Err(UiUpdateError::Publish {
            target: target.to_path_buf(),
            reason: format!("replacing {}: {}", serve.display(), e),
        });
    }

    debug!(target = %target.display(), serve = %serve.display(), "published");
    Ok(())
}
