//! Manager collaborator seam
//!
//! The manager owns state tokens and the transactions keyed by them. The
//! coordinator only calls into it at token creation and at transaction
//! boundaries, and never while holding any of its own locks.

pub mod memory;

pub use memory::{InMemoryManager, ManagerCall, MemoryManagerError, StateRecord};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::context::StateToken;

/// Error type returned by manager implementations
pub type ManagerError = Box<dyn std::error::Error + Send + Sync>;

/// The manager calls that can fail at a transaction boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Boundary {
    CreateState,
    Start,
    Finish,
    Cancel,
}

impl Boundary {
    pub fn as_str(&self) -> &'static str {
        match self {
            Boundary::CreateState => "create state",
            Boundary::Start => "start transaction",
            Boundary::Finish => "finish transaction",
            Boundary::Cancel => "cancel transaction",
        }
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the host side of every manager call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSession {
    host_identifier: String,
    session_id: Uuid,
}

impl HostSession {
    pub fn new(host_identifier: impl Into<String>) -> Self {
        Self {
            host_identifier: host_identifier.into(),
            session_id: Uuid::new_v4(),
        }
    }

    pub fn host_identifier(&self) -> &str {
        &self.host_identifier
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

/// Manager-owned authority on state tokens and their transactions
///
/// Implementations must tolerate the same token being referenced by several
/// logically parallel call sequences (thawed workers), provided only one of
/// them drives transaction boundaries.
pub trait ManagerStateStore: Send + Sync {
    /// Mint a new state token, optionally derived from a parent's
    fn create_state(
        &self,
        session: &HostSession,
        parent: Option<&StateToken>,
    ) -> Result<StateToken, ManagerError>;

    /// Open the transaction keyed by `state`
    fn start_transaction(&self, session: &HostSession, state: &StateToken) -> Result<(), ManagerError>;

    /// Commit the open transaction keyed by `state`
    fn finish_transaction(&self, session: &HostSession, state: &StateToken) -> Result<(), ManagerError>;

    /// Discard the open transaction keyed by `state`
    fn cancel_transaction(&self, session: &HostSession, state: &StateToken) -> Result<(), ManagerError>;
}
