//! Error conversion implementations for UiUpdateError
//!
//! This module provides From trait implementations for converting
//! external error types into UiUpdateError variants.

use super::types::{UiUpdateError, ZkErrorCode};

// Serialization error conversions
impl From<serde_json::Error> for UiUpdateError {
    fn from(err: serde_json::Error) -> Self {
        UiUpdateError::JsonError(Box::new(err))
    }
}

impl From<toml::de::Error> for UiUpdateError {
    fn from(err: toml::de::Error) -> Self {
        UiUpdateError::ConfigurationError {
            component: "toml_parser".to_string(),
            message: format!("Failed to parse TOML configuration: {}", err),
        }
    }
}

// System error conversions
impl From<std::io::Error> for UiUpdateError {
    fn from(err: std::io::Error) -> Self {
        UiUpdateError::IoError(Box::new(err))
    }
}

impl From<std::net::AddrParseError> for UiUpdateError {
    fn from(err: std::net::AddrParseError) -> Self {
        UiUpdateError::ConfigurationError {
            component: "network_address".to_string(),
            message: format!("Invalid network address: {}", err),
        }
    }
}

impl From<std::num::ParseIntError> for UiUpdateError {
    fn from(err: std::num::ParseIntError) -> Self {
        UiUpdateError::ConfigurationError {
            component: "numeric_value".to_string(),
            message: format!("Invalid numeric value: {}", err),
        }
    }
}

// Network error conversions
impl From<reqwest::Error> for UiUpdateError {
    fn from(err: reqwest::Error) -> Self {
        UiUpdateError::Http(Box::new(err))
    }
}

// Coordination service error conversions
impl From<zookeeper::ZkError> for ZkErrorCode {
    fn from(err: zookeeper::ZkError) -> Self {
        use zookeeper::ZkError;
        match err {
            ZkError::NoNode => ZkErrorCode::NoNode,
            ZkError::NodeExists => ZkErrorCode::NodeExists,
            ZkError::BadVersion => ZkErrorCode::BadVersion,
            ZkError::NotEmpty => ZkErrorCode::NotEmpty,
            ZkError::ConnectionLoss => ZkErrorCode::ConnectionLoss,
            ZkError::SessionExpired => ZkErrorCode::SessionExpired,
            ZkError::OperationTimeout => ZkErrorCode::OperationTimeout,
            other => ZkErrorCode::Other(format!("{:?}", other)),
        }
    }
}

// Async/Task error conversions
impl From<tokio::task::JoinError> for UiUpdateError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            UiUpdateError::Internal {
                message: "Task was cancelled".to_string(),
            }
        } else if err.is_panic() {
            UiUpdateError::Internal {
                message: "Task panicked".to_string(),
            }
        } else {
            UiUpdateError::Internal {
                message: format!("Task failed: {}", err),
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for UiUpdateError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        UiUpdateError::Timeout {
            operation: "async_operation".to_string(),
            duration: std::time::Duration::from_secs(0),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for UiUpdateError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        UiUpdateError::Internal {
            message: "Channel receive failed: sender dropped".to_string(),
        }
    }
}

impl From<std::string::FromUtf8Error> for UiUpdateError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        UiUpdateError::Internal {
            message: format!("Invalid UTF-8 data: {}", err),
        }
    }
}
