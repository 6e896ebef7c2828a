pub mod agent;
pub mod config;
pub mod error;
pub mod loader;
pub mod manager;
pub mod node;
pub mod operation;
pub mod registry;
pub mod retry;
pub mod service;
pub mod types;
pub mod version_store;
pub mod watcher;
pub mod zk;

pub use agent::{UiAgent, UiAgentBuilder};
pub use config::AgentConfig;
pub use error::{UiUpdateError, UiUpdateResult};
pub use service::{ResetOutcome, UiService, UpdateOutcome, VersionInfo};
pub use types::{OperationResult, UiVersion};
