//! Znode layout under the configured base path
//!
//! ```text
//! <base>/version                 current UI version
//! <base>/cluster-status          "<op>:<state>[:<version>]" or "Idle"
//! <base>/update-leader           node id of the operation leader
//! <base>/node-status/<node id>   ephemeral per-node status
//! ```

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZnodeLayout {
    base: String,
}

impl ZnodeLayout {
    /// `base` must already be normalised
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn version(&self) -> String {
        format!("{}/version", self.base)
    }

    pub fn cluster_status(&self) -> String {
        format!("{}/cluster-status", self.base)
    }

    pub fn update_leader(&self) -> String {
        format!("{}/update-leader", self.base)
    }

    pub fn node_status_root(&self) -> String {
        format!("{}/node-status", self.base)
    }

    pub fn node_status(&self, node_id: &str) -> String {
        format!("{}/node-status/{}", self.base, node_id)
    }
}
