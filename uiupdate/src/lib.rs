pub mod http;
pub mod listener;

pub use http::create_router;

// Re-export commonly used types
pub use uiupdate_core::{
    AgentConfig, UiAgent, UiService, UiUpdateError, UiUpdateResult, UiVersion,
};
