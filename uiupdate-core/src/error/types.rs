//! Core error types for the UI update agent
//!
//! This module contains the main UiUpdateError enum with all error variants
//! and associated type aliases for Result types.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result codes reported by the coordination service
///
/// Only the codes the agent reacts to are named; everything else is carried
/// as `Other` with the service's own description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZkErrorCode {
    NoNode,
    NodeExists,
    BadVersion,
    NotEmpty,
    ConnectionLoss,
    SessionExpired,
    OperationTimeout,
    Other(String),
}

impl std::fmt::Display for ZkErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZkErrorCode::NoNode => write!(f, "node does not exist"),
            ZkErrorCode::NodeExists => write!(f, "node already exists"),
            ZkErrorCode::BadVersion => write!(f, "version conflict"),
            ZkErrorCode::NotEmpty => write!(f, "node has children"),
            ZkErrorCode::ConnectionLoss => write!(f, "connection lost"),
            ZkErrorCode::SessionExpired => write!(f, "session expired"),
            ZkErrorCode::OperationTimeout => write!(f, "operation timed out"),
            ZkErrorCode::Other(detail) => write!(f, "{}", detail),
        }
    }
}

/// Error type for every operation of the agent
///
/// # Error Categories
///
/// - **Local filesystem**: symlinks, version directories, versions root
/// - **Package registry**: registry requests and package assets
/// - **Coordination**: connection state, cluster lock, znode access
/// - **Watchers**: construction-time failures of the node watchers
/// - **Ambient**: configuration, IO, serialization, timeouts
#[derive(Error, Debug)]
pub enum UiUpdateError {
    // Local filesystem
    #[error("UI dist symlink not found at {path:?}")]
    UiDistSymlinkNotFound { path: PathBuf },

    #[error("Versions path does not exist: {path:?}")]
    VersionsPathDoesNotExist { path: PathBuf },

    #[error("Could not get current version: {reason}")]
    CouldNotGetCurrentVersion { reason: String },

    #[error("Could not create new version directory {path:?}")]
    CouldNotCreateNewVersionDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed removing version '{version}'")]
    RemovingVersion {
        version: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed reading versions from {path:?}")]
    ReadingVersions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Multiple versions found in versions root: {versions:?}")]
    MultipleVersionFound { versions: Vec<String> },

    #[error("Refusing to manage potentially dangerous versions root {path:?}")]
    PotentiallyDangerousVersionsRoot { path: PathBuf },

    #[error("Failed to publish {target:?}: {reason}")]
    Publish { target: PathBuf, reason: String },

    // Package registry
    #[error("Package registry request to {endpoint} failed: {message}")]
    CosmosRequestFailure { endpoint: String, message: String },

    #[error("Requested version '{version}' not found")]
    RequestedVersionNotFound { version: String },

    #[error("UI package asset not found for version '{version}'")]
    UiPackageAssetNotFound { version: String },

    #[error("UI package asset has a bad URI '{uri}': {reason}")]
    UiPackageAssetBadUri { uri: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] Box<reqwest::Error>),

    // Coordination
    #[error("Zookeeper is not connected")]
    ZookeeperNotConnected,

    #[error("Cluster lock is not available, current status '{current}'")]
    ClusterLockNotAvailable { current: String },

    #[error("Coordination operation '{operation}' on {path} failed: {code}")]
    Coordination {
        operation: String,
        path: String,
        code: ZkErrorCode,
    },

    // Watchers
    #[error("No listener provided for watcher on {path}")]
    ListenerNotProvided { path: String },

    #[error("Client disconnected while creating watcher on {path}")]
    Disconnected { path: String },

    #[error("Node does not exist: {path}")]
    NodeDoesNotExist { path: String },

    #[error("Failed to read node {path}")]
    FailedToReadNode {
        path: String,
        #[source]
        source: Box<UiUpdateError>,
    },

    // Ambient
    #[error("Configuration error in {component}: {message}")]
    ConfigurationError { component: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] Box<std::io::Error>),

    #[error("JSON error: {0}")]
    JsonError(#[from] Box<serde_json::Error>),

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl UiUpdateError {
    /// Build a coordination error for `operation` on `path`
    pub fn coordination(
        operation: impl Into<String>,
        path: impl Into<String>,
        code: ZkErrorCode,
    ) -> Self {
        UiUpdateError::Coordination {
            operation: operation.into(),
            path: path.into(),
            code,
        }
    }

    /// The coordination result code, if this is a coordination error
    pub fn zk_code(&self) -> Option<&ZkErrorCode> {
        match self {
            UiUpdateError::Coordination { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self.zk_code(), Some(ZkErrorCode::NoNode))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self.zk_code(), Some(ZkErrorCode::NodeExists))
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self.zk_code(), Some(ZkErrorCode::BadVersion))
    }

    /// Whether the failure is caused by a lost connection rather than by the request
    pub fn is_connection_error(&self) -> bool {
        if let UiUpdateError::FailedToReadNode { source, .. } = self {
            return source.is_connection_error();
        }
        matches!(
            self,
            UiUpdateError::ZookeeperNotConnected
                | UiUpdateError::Disconnected { .. }
                | UiUpdateError::Coordination {
                    code: ZkErrorCode::ConnectionLoss | ZkErrorCode::SessionExpired,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, UiUpdateError>;
pub type UiUpdateResult<T> = std::result::Result<T, UiUpdateError>;
