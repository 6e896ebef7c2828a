//! Cluster and per-node status codec
//!
//! Statuses are stored as `<operation>:<state>[:<version>]`. The empty string
//! and the bare `Idle` sentinel both decode to idle; the encoder only ever
//! emits `Idle` for it. Unknown tokens decode to `Unknown` instead of failing,
//! and so does an operation whose version is not a plain directory name.

use crate::types::UiVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of cluster operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Idle,
    Update,
    Reset,
    Unknown,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Idle => "Idle",
            Operation::Update => "Update",
            Operation::Reset => "Reset",
            Operation::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Idle" => Operation::Idle,
            "Update" => Operation::Update,
            "Reset" => Operation::Reset,
            _ => Operation::Unknown,
        })
    }
}

/// Phase of an operation, cluster-wide or on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Requested,
    InProgress,
    Complete,
    Failed,
    Idle,
    Ready,
    Unknown,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Requested => "Requested",
            OperationState::InProgress => "InProgress",
            OperationState::Complete => "Complete",
            OperationState::Failed => "Failed",
            OperationState::Idle => "Idle",
            OperationState::Ready => "Ready",
            OperationState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Requested" => OperationState::Requested,
            "InProgress" => OperationState::InProgress,
            "Complete" => OperationState::Complete,
            "Failed" => OperationState::Failed,
            "Idle" => OperationState::Idle,
            "Ready" => OperationState::Ready,
            _ => OperationState::Unknown,
        })
    }
}

/// Decoded cluster or per-node status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation: Operation,
    pub state: OperationState,
    /// Target version, carried by update operations only
    pub version: Option<UiVersion>,
}

impl OperationStatus {
    pub fn idle() -> Self {
        Self {
            operation: Operation::Idle,
            state: OperationState::Idle,
            version: None,
        }
    }

    pub fn new(operation: Operation, state: OperationState, version: Option<UiVersion>) -> Self {
        Self {
            operation,
            state,
            version,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.operation == Operation::Idle && self.state == OperationState::Idle
    }

    /// Same status with another state
    pub fn with_state(&self, state: OperationState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Whether both statuses describe the same operation
    pub fn same_operation(&self, other: &OperationStatus) -> bool {
        self.operation == other.operation && self.version == other.version
    }

    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "Idle" {
            return Self::idle();
        }

        let mut parts = raw.splitn(3, ':');
        let operation = parts
            .next()
            .map(|token| token.parse().unwrap_or(Operation::Unknown))
            .unwrap_or(Operation::Unknown);
        let state = parts
            .next()
            .map(|token| token.parse().unwrap_or(OperationState::Unknown))
            .unwrap_or(OperationState::Unknown);
        let version = match parts.next().map(UiVersion::parse).transpose() {
            Ok(version) => version,
            Err(_) => {
                return Self {
                    operation: Operation::Unknown,
                    state,
                    version: None,
                }
            }
        };

        Self {
            operation,
            state,
            version,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(bytes))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl Default for OperationStatus {
    fn default() -> Self {
        Self::idle()
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle() && self.version.is_none() {
            return f.write_str("Idle");
        }
        write!(f, "{}:{}", self.operation, self.state)?;
        if let Some(version) = &self.version {
            write!(f, ":{}", version.as_str())?;
        }
        Ok(())
    }
}
