//! Shared value types

use crate::error::{UiUpdateError, UiUpdateResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

/// Version of a UI package, e.g. `2.24.4`
///
/// The empty string is the pre-bundled UI shipped with the host. Any other
/// version names a directory under the versions root and must be a single
/// plain path component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UiVersion(String);

impl UiVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Checked constructor for versions received from clients or the cluster
    pub fn parse(version: impl Into<String>) -> UiUpdateResult<Self> {
        let version = Self(version.into());
        version.validate()?;
        Ok(version)
    }

    /// Fails with `RequestedVersionNotFound` unless the version is usable as a directory name
    pub fn validate(&self) -> UiUpdateResult<()> {
        if self.is_prebundled() || is_single_component(&self.0) {
            Ok(())
        } else {
            Err(UiUpdateError::RequestedVersionNotFound {
                version: self.0.clone(),
            })
        }
    }

    /// The pre-bundled version
    pub fn prebundled() -> Self {
        Self(String::new())
    }

    pub fn is_prebundled(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }

    /// Decode and check a version stored in a znode; invalid UTF-8 is replaced
    pub fn from_bytes(bytes: &[u8]) -> UiUpdateResult<Self> {
        Self::parse(String::from_utf8_lossy(bytes).trim())
    }
}

fn is_single_component(name: &str) -> bool {
    if name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl fmt::Display for UiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_prebundled() {
            write!(f, "<pre-bundled>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for UiVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UiVersion {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Outcome of a cluster-wide reset or update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub successful: bool,
    pub message: String,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            successful: true,
            message: "OK".to_string(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prebundled_version() {
        assert!(UiVersion::prebundled().is_prebundled());
        assert!(UiVersion::from_bytes(b"").unwrap().is_prebundled());
        assert!(!UiVersion::new("2.24.4").is_prebundled());
        assert_eq!(UiVersion::prebundled().to_string(), "<pre-bundled>");
    }

    #[test]
    fn test_from_bytes_trims_whitespace() {
        assert_eq!(
            UiVersion::from_bytes(b"2.24.4\n").unwrap(),
            UiVersion::new("2.24.4")
        );
    }

    #[test]
    fn test_parse_accepts_plain_names() {
        for version in ["2.24.4", "1.0:beta", "v3-rc.1", "..2", ""] {
            assert!(UiVersion::parse(version).is_ok(), "{:?}", version);
        }
    }

    #[test]
    fn test_parse_rejects_paths() {
        for version in [".", "..", "/etc", "../ui", "2.24.4/dist", "a\\b", "nul\0", "./2.0"] {
            assert!(
                matches!(
                    UiVersion::parse(version),
                    Err(UiUpdateError::RequestedVersionNotFound { .. })
                ),
                "{:?}",
                version
            );
        }
        assert!(UiVersion::from_bytes(b"..\n").is_err());
    }
}
