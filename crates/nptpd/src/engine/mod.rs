//! The bridging engine: components A-F plus their supporting data model.

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod log_state;
pub mod mapping;
pub mod pipe_client;
pub mod supervisor;
pub mod tcp_listener;
pub mod watcher;

pub use error::{EngineError, Result};
pub use supervisor::EngineSettings;
