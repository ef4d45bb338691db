// Core infrastructure shared by the coordinator and the manager seam

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{CoordinatorConfig, CoordinatorConfigBuilder, TokenFormat};
pub use errors::{BridgeError, Result};
