//! Liaison: transaction coordination and state correlation between a host
//! and an asset manager.
//!
//! A host obtains a [`Context`] from the [`TransactionCoordinator`], groups
//! its manager calls into nested action groups with `scoped_enter`, and can
//! freeze the Context into a [`PortableToken`] so work in other processes
//! stays correlated with the same manager state.

// Core infrastructure modules
pub mod core;

pub mod context;
pub mod coord;
pub mod manager;

// Re-exports for convenience
pub use context::{AccessIntent, Context, Locale, Retention, StateToken};
pub use coord::{
    ActionGroupStack, CoordinatorStats, PortableToken, ScopeExit, ScopeHandle, StateTokenCodec,
    TransactionCoordinator, TransactionId, Transition,
};
pub use crate::core::config::{CoordinatorConfig, CoordinatorConfigBuilder, TokenFormat};
pub use crate::core::errors::{BridgeError, Result};
pub use manager::{Boundary, HostSession, InMemoryManager, ManagerError, ManagerStateStore};
